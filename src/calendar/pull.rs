//! `PullStrategy`: the three-tier change-discovery fallback (ctag fast path
//! -> sync-collection incremental -> time-range full) plus master/exception
//! reconciliation against the local store.

use crate::calendar::client::{CalDavError, CalDavTransport};
use crate::calendar::ical::{CalcardCodec, IcalCodec};
use crate::calendar::occurrence::{MaterializerError, OccurrenceMaterializer};
use crate::calendar::model::{Calendar, Event, SyncStatus};
use crate::calendar::store::{Store, StoreError};
use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PullError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    CalDav(#[from] CalDavError),
    #[error(transparent)]
    Materializer(#[from] MaterializerError),
}

pub type PullResult<T> = Result<T, PullError>;

#[derive(Debug, Default)]
pub struct PullReport {
    pub tier: &'static str,
    pub fetched: u32,
    pub written: u32,
    pub updated: u32,
    pub deleted: u32,
    pub skipped_parse_error: u32,
}

pub enum PullOutcome {
    NoChanges,
    Applied(PullReport),
}

/// Past/future bound of the tier-3 time-range query: `[now - 90d, now + 2y]`.
const TIME_RANGE_PAST: Duration = Duration::days(90);
const TIME_RANGE_FUTURE: Duration = Duration::days(365 * 2);

pub struct PullStrategy<'a> {
    client: &'a dyn CalDavTransport,
    store: &'a Store,
    codec: CalcardCodec,
}

impl<'a> PullStrategy<'a> {
    pub fn new(client: &'a dyn CalDavTransport, store: &'a Store) -> Self {
        Self { client, store, codec: CalcardCodec::new() }
    }

    pub async fn pull_calendar(&self, calendar: &Calendar, force_full_sync: bool) -> PullResult<PullOutcome> {
        if !force_full_sync {
            if let Some(ctag) = self.client.get_ctag(&calendar.remote_url).await? {
                if Some(&ctag) == calendar.ctag.as_ref() {
                    debug!(calendar_id = %calendar.id, "ctag unchanged, no pull needed");
                    return Ok(PullOutcome::NoChanges);
                }
            }
        }

        if let Some(token) = &calendar.sync_token {
            match self.client.sync_collection(&calendar.remote_url, Some(token)).await {
                Ok(delta) => {
                    let mut report = PullReport { tier: "incremental", ..Default::default() };
                    let changed_hrefs: Vec<String> = delta.changed.iter().map(|c| c.href.clone()).collect();
                    let items = self.client.fetch_events_by_href(&calendar.remote_url, &changed_hrefs).await?;
                    report.fetched = items.len() as u32;
                    for item in &items {
                        self.reconcile_body(calendar, &item.href, item.etag.as_deref(), &item.ical_text, &mut report).await?;
                    }
                    for href in &delta.deleted {
                        if let Some(event) = self.store.get_event_by_caldav_url(&calendar.id, href).await? {
                            self.store.delete_event(&event.id, &calendar.id).await?;
                            report.deleted += 1;
                        }
                    }
                    let ctag = self.client.get_ctag(&calendar.remote_url).await?;
                    self.store.update_sync_tokens(&calendar.id, ctag.as_deref(), delta.new_token.as_deref()).await?;
                    return Ok(PullOutcome::Applied(report));
                }
                Err(CalDavError::SyncTokenInvalid) => {
                    warn!(calendar_id = %calendar.id, "sync token rejected by server, discarding and falling back to full sync");
                    self.store.update_sync_tokens(&calendar.id, calendar.ctag.as_deref(), None).await?;
                }
                Err(other) => return Err(other.into()),
            }
        }

        self.pull_full(calendar).await
    }

    async fn pull_full(&self, calendar: &Calendar) -> PullResult<PullOutcome> {
        let now = Utc::now();
        let start = self.client.format_date_for_query(now - TIME_RANGE_PAST);
        let end = self.client.format_date_for_query(now + TIME_RANGE_FUTURE);

        let items = self.client.fetch_events_in_range(&calendar.remote_url, &start, &end).await?;
        let mut report = PullReport { tier: "full", ..Default::default() };
        report.fetched = items.len() as u32;

        let mut seen_hrefs = std::collections::HashSet::new();
        for item in &items {
            seen_hrefs.insert(item.href.clone());
            self.reconcile_body(calendar, &item.href, item.etag.as_deref(), &item.ical_text, &mut report).await?;
        }

        // Local-event cleanup: a SYNCED event whose caldav_url wasn't in the
        // returned set no longer exists on the server.
        for event in self.store.get_events_for_calendar(&calendar.id).await? {
            if event.sync_status != SyncStatus::Synced {
                continue;
            }
            if let Some(url) = &event.caldav_url {
                if !seen_hrefs.contains(url) {
                    self.store.delete_event(&event.id, &calendar.id).await?;
                    report.deleted += 1;
                }
            }
        }

        let ctag = self.client.get_ctag(&calendar.remote_url).await?;
        self.store.update_sync_tokens(&calendar.id, ctag.as_deref(), None).await?;
        Ok(PullOutcome::Applied(report))
    }

    /// Parse one fetched iCal body (which may hold a master plus zero or
    /// more exceptions sharing its UID) and upsert them in master-then-
    /// exception order, per `spec.md` §4.7 ("exceptions must be processed
    /// after their master exists in the same transaction").
    async fn reconcile_body(
        &self,
        calendar: &Calendar,
        href: &str,
        etag: Option<&str>,
        ical_text: &str,
        report: &mut PullReport,
    ) -> PullResult<()> {
        let parsed = match self.codec.parse(ical_text, &calendar.id) {
            Ok(parsed) => parsed,
            Err(_) => {
                report.skipped_parse_error += 1;
                return Ok(());
            }
        };
        report.skipped_parse_error += parsed.parse_errors.len() as u32;

        let (masters, exceptions): (Vec<Event>, Vec<Event>) =
            parsed.events.into_iter().partition(|e| e.original_instance_time.is_none());

        let mut master_id = None;
        for mut master in masters {
            master.caldav_url = Some(href.to_string());
            master.etag = etag.map(normalize_incoming_etag);
            master.sync_status = SyncStatus::Synced;
            let existing = self
                .store
                .get_event_by_uid(&calendar.id, &master.uid, None)
                .await?;
            if let Some(existing) = &existing {
                master.id = existing.id.clone();
            }
            let recurrence_changed = existing
                .as_ref()
                .map(|e| e.rrule != master.rrule || e.start_ts != master.start_ts || e.end_ts != master.end_ts || e.timezone != master.timezone)
                .unwrap_or(true);
            self.store.upsert_event(&master).await?;
            if existing.is_some() {
                report.updated += 1;
            } else {
                report.written += 1;
            }
            master_id = Some(master.id.clone());

            if recurrence_changed {
                let materializer = OccurrenceMaterializer::new(self.store);
                materializer.regenerate(&master.id).await?;
            }
        }

        for mut exception in exceptions {
            let Some(original_instance_time) = exception.original_instance_time else { continue };
            let Some(master) = self.store.get_event_by_uid(&calendar.id, &exception.uid, None).await? else {
                // Master not present in-store yet (or was concurrently
                // deleted); this insert is dropped, not panicked on, per
                // the foreign-key-violation handling in spec.md §7.
                warn!(uid = %exception.uid, "exception has no master in store, skipping");
                continue;
            };
            exception.original_event_id = Some(master.id.clone());
            exception.caldav_url = Some(href.to_string());
            exception.etag = etag.map(normalize_incoming_etag);
            exception.sync_status = SyncStatus::Synced;

            let existing = self
                .store
                .get_event_by_uid(&calendar.id, &exception.uid, Some(original_instance_time))
                .await?;
            if let Some(existing) = &existing {
                exception.id = existing.id.clone();
            }
            self.store.upsert_event(&exception).await?;
            if existing.is_some() {
                report.updated += 1;
            } else {
                report.written += 1;
            }

            let materializer = OccurrenceMaterializer::new(self.store);
            materializer
                .link_exception(&master.id, original_instance_time, &exception.id)
                .await?;
        }

        let _ = master_id;
        Ok(())
    }
}

fn normalize_incoming_etag(etag: &str) -> String {
    crate::calendar::client::normalize_etag(etag)
}
