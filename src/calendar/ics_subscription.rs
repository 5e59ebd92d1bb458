//! `IcsSubscriptionFetcher`: a read-only, pull-only passive feed fetch,
//! distinct from `CalDavClient` in transport because it is unauthenticated
//! GET against an arbitrary URL rather than a CalDAV collection. Grounded in
//! `CalDavClient`'s conditional-request / retryable-error split, generalized
//! to the ICS-feed retry table in `spec.md` §4.4/§6.

use crate::calendar::ical::{CalcardCodec, IcalCodec, IcalError};
use crate::calendar::model::{Event, IcsSubscription};
use crate::calendar::store::{Store, StoreError};
use chrono::Utc;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const USER_AGENT: &str = "calendar-sync-core/1.0";
const MAX_RETRIES_BEYOND_FIRST: u32 = 2;
const BASE_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum IcsFetchError {
    #[error("connect timeout")]
    ConnectTimeout,
    #[error("read timeout")]
    ReadTimeout,
    #[error("connection reset")]
    ConnectionReset,
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),
    #[error("http {status}: {message}")]
    Http { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error(transparent)]
    InvalidIcs(#[from] IcalError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IcsFetchError {
    /// Mirrors `spec.md` §6's table: network timeout/reset and 5xx/429/503
    /// retry; auth, client errors, 413, SSL handshake, and a malformed body
    /// do not.
    pub fn is_retryable(&self) -> bool {
        match self {
            IcsFetchError::ConnectTimeout | IcsFetchError::ReadTimeout | IcsFetchError::ConnectionReset => true,
            IcsFetchError::Http { status, .. } => *status >= 500 || *status == 429,
            IcsFetchError::TlsHandshake(_)
            | IcsFetchError::InvalidIcs(_)
            | IcsFetchError::Transport(_)
            | IcsFetchError::Store(_) => false,
        }
    }
}

pub enum FetchOutcome {
    NotModified,
    Fetched { events: Vec<Event>, etag: Option<String>, last_modified: Option<String> },
}

pub struct IcsSubscriptionFetcher {
    http: reqwest::Client,
    codec: CalcardCodec,
}

impl IcsSubscriptionFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(60))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { http, codec: CalcardCodec::new() })
    }

    /// One conditional GET, with up to `MAX_RETRIES_BEYOND_FIRST` retries on
    /// a retryable failure, exponential backoff starting at 1s and capped at
    /// ~30s per attempt.
    pub async fn fetch(&self, subscription: &IcsSubscription) -> Result<FetchOutcome, IcsFetchError> {
        let mut attempt = 0u32;
        loop {
            match self.fetch_once(subscription).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < MAX_RETRIES_BEYOND_FIRST => {
                    let backoff = (BASE_BACKOFF * 2u32.pow(attempt)).min(MAX_BACKOFF);
                    warn!(url = %subscription.url, attempt, error = %err, "ICS fetch failed, retrying after backoff");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Fetches `subscription`, applies the outcome to it (new etag/
    /// last-modified on a change, `lastSyncAt`/`nextRefreshAt` either way)
    /// and persists both the subscription row and any fetched events, per
    /// `spec.md` §8 Scenario E. A `NotModified` outcome touches no event
    /// rows, only the subscription's schedule fields.
    pub async fn refresh(
        &self,
        subscription: &mut IcsSubscription,
        store: &Store,
        refresh_interval_minutes: i64,
    ) -> Result<FetchOutcome, IcsFetchError> {
        let outcome = self.fetch(subscription).await?;
        let now = Utc::now();
        if let FetchOutcome::Fetched { events, etag, last_modified } = &outcome {
            for event in events {
                store.upsert_event(event).await?;
            }
            subscription.etag = etag.clone();
            subscription.last_modified = last_modified.clone();
        }
        subscription.last_sync_at = Some(now);
        subscription.next_refresh_at = now + chrono::Duration::minutes(refresh_interval_minutes);
        store.upsert_ics_subscription(subscription).await?;
        Ok(outcome)
    }

    async fn fetch_once(&self, subscription: &IcsSubscription) -> Result<FetchOutcome, IcsFetchError> {
        let mut builder = self.http.get(&subscription.url).header("Accept", "text/calendar, */*");
        if let Some(etag) = &subscription.etag {
            builder = builder.header("If-None-Match", format!("\"{etag}\""));
        }
        if let Some(last_modified) = &subscription.last_modified {
            builder = builder.header("If-Modified-Since", last_modified);
        }

        let response = builder.send().await.map_err(classify_transport_error)?;
        if response.status() == StatusCode::NOT_MODIFIED {
            debug!(url = %subscription.url, "ICS subscription unchanged (304)");
            return Ok(FetchOutcome::NotModified);
        }
        if !response.status().is_success() {
            let status = response.status();
            return Err(IcsFetchError::Http { status: status.as_u16(), message: status.to_string() });
        }

        let etag = response.headers().get("ETag").and_then(|v| v.to_str().ok()).map(crate::calendar::client::normalize_etag);
        let last_modified = response.headers().get("Last-Modified").and_then(|v| v.to_str().ok()).map(str::to_string);
        let body = response.text().await.map_err(classify_transport_error)?;

        ensure_well_formed(&body)?;
        let parsed = self.codec.parse(&body, &subscription.calendar_id)?;
        if !parsed.parse_errors.is_empty() {
            warn!(url = %subscription.url, count = parsed.parse_errors.len(), "ICS subscription had per-event parse errors");
        }

        Ok(FetchOutcome::Fetched { events: parsed.events, etag, last_modified })
    }
}

impl Default for IcsSubscriptionFetcher {
    fn default() -> Self {
        Self::new().expect("reqwest client builder should not fail with static config")
    }
}

/// `BEGIN:VCALENDAR`, `END:VCALENDAR`, and at least one `BEGIN:VEVENT` or
/// `BEGIN:VTODO`, per `spec.md` §6. A body failing this check is an error
/// with no retry, since well-formedness will not change on a re-fetch.
fn ensure_well_formed(body: &str) -> Result<(), IcalError> {
    if body.trim().is_empty() {
        return Err(IcalError::InvalidIcsFormat);
    }
    if !body.contains("BEGIN:VCALENDAR") || !body.contains("END:VCALENDAR") {
        return Err(IcalError::InvalidIcsFormat);
    }
    if !body.contains("BEGIN:VEVENT") && !body.contains("BEGIN:VTODO") {
        return Err(IcalError::InvalidIcsFormat);
    }
    Ok(())
}

/// Mirrors `CalDavClient`'s source-chain sniffing (`reqwest` has no typed
/// connect-timeout/TLS/reset split): a timeout during connect is
/// `ConnectTimeout`, a timeout elsewhere is `ReadTimeout`, a connect failure
/// whose source mentions the handshake is `TlsHandshake`, anything else
/// connect-shaped is `ConnectionReset`.
fn classify_transport_error(err: reqwest::Error) -> IcsFetchError {
    if err.is_timeout() {
        return if err.is_connect() { IcsFetchError::ConnectTimeout } else { IcsFetchError::ReadTimeout };
    }
    if err.is_connect() {
        let detail = std::error::Error::source(&err)
            .map(|s| s.to_string())
            .unwrap_or_else(|| err.to_string());
        if detail.contains("tls") || detail.contains("certificate") || detail.contains("handshake") {
            return IcsFetchError::TlsHandshake(detail);
        }
        return IcsFetchError::ConnectionReset;
    }
    IcsFetchError::Transport(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_check_rejects_empty_body() {
        assert!(matches!(ensure_well_formed(""), Err(IcalError::InvalidIcsFormat)));
    }

    #[test]
    fn well_formed_check_rejects_calendar_with_no_components() {
        let body = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\nEND:VCALENDAR\r\n";
        assert!(matches!(ensure_well_formed(body), Err(IcalError::InvalidIcsFormat)));
    }

    #[test]
    fn well_formed_check_accepts_a_single_vevent() {
        let body = "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:e1\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n";
        assert!(ensure_well_formed(body).is_ok());
    }

    #[test]
    fn server_error_is_retryable_not_found_is_not() {
        assert!(IcsFetchError::Http { status: 503, message: String::new() }.is_retryable());
        assert!(IcsFetchError::Http { status: 429, message: String::new() }.is_retryable());
        assert!(!IcsFetchError::Http { status: 404, message: String::new() }.is_retryable());
        assert!(!IcsFetchError::Http { status: 413, message: String::new() }.is_retryable());
    }
}
