//! `FakeCalDavClient`: an in-memory `CalDavTransport` substituted for the
//! real HTTP transport in `PushStrategy`/`PullStrategy`/`SyncEngine` tests,
//! following the same adapter-substitution pattern as `Store::new_in_memory`.

use crate::calendar::client::{CalDavError, CalDavResult, CalDavTransport, SyncDelta};
use crate::calendar::quirks::{ChangedItem, IcalItem, ParsedCalendarEntry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct FakeResource {
    etag: String,
    ical_text: String,
}

/// A single-collection fake: every URL this fixture is asked about belongs
/// to the same calendar, which is the common case for `PushStrategy`/
/// `PullStrategy` unit tests that only drive one calendar at a time.
pub struct FakeCalDavClient {
    resources: Mutex<HashMap<String, FakeResource>>,
    deleted_since_last_fetch: Mutex<Vec<String>>,
    etag_counter: AtomicU64,
    ctag: Mutex<String>,
    sync_token: Mutex<Option<String>>,
    next_error: Mutex<Option<FakeError>>,
}

#[derive(Clone)]
enum FakeError {
    Unauthorized,
    Conflict,
    SyncTokenInvalid,
}

impl Default for FakeCalDavClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCalDavClient {
    pub fn new() -> Self {
        Self {
            resources: Mutex::new(HashMap::new()),
            deleted_since_last_fetch: Mutex::new(Vec::new()),
            etag_counter: AtomicU64::new(1),
            ctag: Mutex::new("ctag-0".to_string()),
            sync_token: Mutex::new(None),
            next_error: Mutex::new(None),
        }
    }

    /// Pre-populate the fake store as if the server already held this event
    /// body at `url`, for pull-path tests that start from existing content.
    pub fn seed(&self, url: &str, ical_text: &str) -> String {
        let etag = self.next_etag();
        self.resources.lock().unwrap().insert(
            url.to_string(),
            FakeResource { etag: etag.clone(), ical_text: ical_text.to_string() },
        );
        self.bump_ctag();
        etag
    }

    pub fn fail_next_with_unauthorized(&self) {
        *self.next_error.lock().unwrap() = Some(FakeError::Unauthorized);
    }

    pub fn fail_next_with_conflict(&self) {
        *self.next_error.lock().unwrap() = Some(FakeError::Conflict);
    }

    pub fn fail_next_with_invalid_sync_token(&self) {
        *self.next_error.lock().unwrap() = Some(FakeError::SyncTokenInvalid);
    }

    fn take_error(&self) -> Option<FakeError> {
        self.next_error.lock().unwrap().take()
    }

    fn next_etag(&self) -> String {
        format!("etag-{}", self.etag_counter.fetch_add(1, Ordering::SeqCst))
    }

    fn bump_ctag(&self) {
        let next = self.etag_counter.load(Ordering::SeqCst);
        *self.ctag.lock().unwrap() = format!("ctag-{next}");
    }
}

#[async_trait::async_trait]
impl CalDavTransport for FakeCalDavClient {
    async fn discover_principal(&self) -> CalDavResult<Option<String>> {
        Ok(Some("/principals/fake/".to_string()))
    }

    async fn discover_calendar_home(&self, _principal_url: &str) -> CalDavResult<Vec<String>> {
        Ok(vec!["/calendars/fake/".to_string()])
    }

    async fn list_calendars(&self, _home_url: &str) -> CalDavResult<Vec<ParsedCalendarEntry>> {
        Ok(Vec::new())
    }

    async fn get_ctag(&self, _calendar_url: &str) -> CalDavResult<Option<String>> {
        if let Some(FakeError::Unauthorized) = self.take_error() {
            return Err(CalDavError::Unauthorized);
        }
        Ok(Some(self.ctag.lock().unwrap().clone()))
    }

    async fn fetch_etags_in_range(&self, _calendar_url: &str, _start: &str, _end: &str) -> CalDavResult<Vec<ChangedItem>> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .iter()
            .map(|(href, r)| ChangedItem { href: href.clone(), etag: Some(r.etag.clone()) })
            .collect())
    }

    async fn fetch_events_in_range(&self, _calendar_url: &str, _start: &str, _end: &str) -> CalDavResult<Vec<IcalItem>> {
        Ok(self
            .resources
            .lock()
            .unwrap()
            .iter()
            .map(|(href, r)| IcalItem { href: href.clone(), etag: Some(r.etag.clone()), ical_text: r.ical_text.clone() })
            .collect())
    }

    async fn fetch_events_by_href(&self, _calendar_url: &str, hrefs: &[String]) -> CalDavResult<Vec<IcalItem>> {
        let resources = self.resources.lock().unwrap();
        Ok(hrefs
            .iter()
            .filter_map(|href| {
                resources.get(href).map(|r| IcalItem {
                    href: href.clone(),
                    etag: Some(r.etag.clone()),
                    ical_text: r.ical_text.clone(),
                })
            })
            .collect())
    }

    async fn sync_collection(&self, _calendar_url: &str, _token: Option<&str>) -> CalDavResult<SyncDelta> {
        if let Some(FakeError::SyncTokenInvalid) = self.take_error() {
            return Err(CalDavError::SyncTokenInvalid);
        }
        let changed = self
            .resources
            .lock()
            .unwrap()
            .iter()
            .map(|(href, r)| ChangedItem { href: href.clone(), etag: Some(r.etag.clone()) })
            .collect();
        let deleted = std::mem::take(&mut *self.deleted_since_last_fetch.lock().unwrap());
        let new_token = Some(format!("token-{}", self.etag_counter.load(Ordering::SeqCst)));
        *self.sync_token.lock().unwrap() = new_token.clone();
        Ok(SyncDelta { changed, deleted, new_token })
    }

    async fn put_event(&self, url: &str, ical: &str, if_match_etag: Option<&str>, if_none_match: bool) -> CalDavResult<String> {
        match self.take_error() {
            Some(FakeError::Unauthorized) => return Err(CalDavError::Unauthorized),
            Some(FakeError::Conflict) => return Err(CalDavError::Conflict),
            _ => {}
        }
        let mut resources = self.resources.lock().unwrap();
        if if_none_match && resources.contains_key(url) {
            return Err(CalDavError::Conflict);
        }
        if let Some(expected) = if_match_etag {
            match resources.get(url) {
                Some(existing) if existing.etag != expected => return Err(CalDavError::Conflict),
                None => return Err(CalDavError::Http { status: 404, message: "not found".to_string() }),
                _ => {}
            }
        }
        let etag = self.next_etag();
        resources.insert(url.to_string(), FakeResource { etag: etag.clone(), ical_text: ical.to_string() });
        drop(resources);
        self.bump_ctag();
        Ok(etag)
    }

    async fn delete_event(&self, url: &str, if_match_etag: Option<&str>) -> CalDavResult<()> {
        if let Some(FakeError::Unauthorized) = self.take_error() {
            return Err(CalDavError::Unauthorized);
        }
        let mut resources = self.resources.lock().unwrap();
        if let Some(existing) = resources.get(url) {
            if let Some(expected) = if_match_etag {
                if existing.etag != expected {
                    return Err(CalDavError::Conflict);
                }
            }
            resources.remove(url);
            drop(resources);
            self.deleted_since_last_fetch.lock().unwrap().push(url.to_string());
            self.bump_ctag();
        }
        Ok(())
    }

    fn event_url_for(&self, calendar_url: &str, filename: &str) -> String {
        format!("{}/{}", calendar_url.trim_end_matches('/'), filename)
    }

    fn requires_app_specific_password(&self) -> bool {
        false
    }

    fn format_date_for_query(&self, ts: chrono::DateTime<chrono::Utc>) -> String {
        ts.format("%Y%m%dT%H%M%SZ").to_string()
    }

    async fn test_connection(&self) -> CalDavResult<bool> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_update_round_trips_through_the_fake() {
        let fake = FakeCalDavClient::new();
        let etag1 = fake.put_event("https://dav/cal/e1.ics", "BEGIN:VEVENT\r\nEND:VEVENT", None, true).await.unwrap();
        let etag2 = fake
            .put_event("https://dav/cal/e1.ics", "BEGIN:VEVENT\r\nSUMMARY:x\r\nEND:VEVENT", Some(&etag1), false)
            .await
            .unwrap();
        assert_ne!(etag1, etag2);

        let items = fake
            .fetch_events_by_href("https://dav/cal/", &["https://dav/cal/e1.ics".to_string()])
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].ical_text.contains("SUMMARY:x"));
    }

    #[tokio::test]
    async fn create_with_if_none_match_conflicts_on_existing_resource() {
        let fake = FakeCalDavClient::new();
        fake.put_event("https://dav/cal/e1.ics", "BEGIN:VEVENT\r\nEND:VEVENT", None, true).await.unwrap();
        let err = fake
            .put_event("https://dav/cal/e1.ics", "BEGIN:VEVENT\r\nEND:VEVENT", None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, CalDavError::Conflict));
    }

    #[tokio::test]
    async fn stale_if_match_etag_is_rejected() {
        let fake = FakeCalDavClient::new();
        fake.put_event("https://dav/cal/e1.ics", "BEGIN:VEVENT\r\nEND:VEVENT", None, true).await.unwrap();
        let err = fake
            .put_event("https://dav/cal/e1.ics", "BEGIN:VEVENT\r\nEND:VEVENT", Some("stale-etag"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, CalDavError::Conflict));
    }
}
