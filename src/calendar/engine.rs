//! `SyncEngine`: per-calendar `push -> resolve-conflicts -> pull ->
//! record-session` orchestration, and the per-account fan-out above it. The
//! single admission point a host scheduler calls into (`spec.md` §5
//! "Scheduling model" — the scheduler itself is out of scope here).

use crate::calendar::client::{CalDavError, CalDavTransport};
use crate::calendar::conflict::{ConflictPolicy, ConflictResolver, ResolutionResult};
use crate::calendar::ical::{CalcardCodec, IcalCodec};
use crate::calendar::model::{
    Account, Calendar, PendingOperationStatus, SyncLog, SyncSession, SyncSessionStatus, SyncStatus, SyncType,
    MAX_CONFLICT_SYNC_CYCLES,
};
use crate::calendar::notifications::CalendarNotificationManager;
use crate::calendar::pull::{PullOutcome, PullStrategy};
use crate::calendar::push::{PushError, PushStrategy};
use crate::calendar::queue::PendingQueue;
use crate::calendar::store::{Store, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("a sync for this account is already in progress")]
    AlreadySyncing,
    #[error("no accounts configured")]
    NoAccountsConfigured,
    #[error("sync completed with {0} calendar error(s)")]
    PartialFailure(usize),
    #[error("sync was cancelled")]
    Cancelled,
}

pub type SyncEngineResult<T> = Result<T, SyncError>;

/// Per-account aggregate, per `spec.md` §4.9's "single `SyncResult` variant".
#[derive(Debug)]
pub enum SyncResult {
    Success,
    PartialSuccess(Vec<String>),
    AuthError(String),
    Error(String),
}

const DEFAULT_PUSH_BATCH_LIMIT: i64 = 50;

pub struct SyncEngine {
    store: Arc<Store>,
    notifications: Arc<CalendarNotificationManager>,
    account_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    push_batch_limit: i64,
    cancel: Option<tokio::sync::watch::Receiver<bool>>,
}

impl SyncEngine {
    pub fn new(store: Arc<Store>, notifications: Arc<CalendarNotificationManager>) -> Self {
        Self {
            store,
            notifications,
            account_locks: Mutex::new(HashMap::new()),
            push_batch_limit: DEFAULT_PUSH_BATCH_LIMIT,
            cancel: None,
        }
    }

    pub fn with_push_batch_limit(mut self, limit: i64) -> Self {
        self.push_batch_limit = limit;
        self
    }

    /// Wires a cooperative cancellation flag (`spec.md` §5 "Cancellation").
    /// Checked between `sync_calendar`'s push/resolve/pull phases, never
    /// mid-operation — a pending operation is never left `IN_PROGRESS` on
    /// cancellation since `PushStrategy` always finishes the op it started.
    pub fn with_cancellation(mut self, cancel: tokio::sync::watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    async fn lock_for_account(&self, account_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.account_locks.lock().await;
        locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// `push -> resolve conflicts -> pull -> record session`, for one
    /// calendar. Exactly one `SyncSession` row is persisted per call, even
    /// on early return.
    pub async fn sync_calendar(
        &self,
        client: &dyn CalDavTransport,
        calendar: &Calendar,
        conflict_policy: ConflictPolicy,
        trigger_source: &str,
    ) -> SyncEngineResult<SyncSession> {
        let started = std::time::Instant::now();
        let mut session = SyncSession::start(
            calendar.id.clone(),
            calendar.display_name.clone(),
            SyncType::Incremental,
            trigger_source.to_string(),
        );

        let mut calendar = calendar.clone();
        let mut auth_error: Option<String> = None;

        if self.is_cancelled() {
            return self.record_cancelled(session).await;
        }

        if !calendar.is_read_only {
            match PushStrategy::new(client, &self.store)
                .push_calendar(&calendar.id, &calendar.remote_url, self.push_batch_limit)
                .await
            {
                Ok(report) => {
                    session.events_pushed_created += report.created;
                    session.events_pushed_updated += report.updated;
                    session.events_pushed_deleted += report.deleted;
                }
                Err(PushError::Unauthorized) => {
                    auth_error = Some("unauthorized while pushing".to_string());
                }
                Err(PushError::Store(e)) => {
                    return Err(SyncError::Store(e));
                }
            }
        }

        if self.is_cancelled() {
            return self.record_cancelled(session).await;
        }

        let mut abandoned_titles = Vec::new();
        if auth_error.is_none() {
            let abandoned = self
                .resolve_conflicts(client, &mut calendar, conflict_policy, &mut session)
                .await?;
            abandoned_titles = abandoned;

            let queue = PendingQueue::new(&self.store);
            let swept = queue.sweep(&calendar.id).await?;
            abandoned_titles.extend(swept.abandoned_titles);
        }

        // A conflict resolved by SERVER_WINS, or a swept abandonment, clears
        // the calendar's ctag to force a full pull (spec.md §4.5/§4.8); this
        // re-read picks that up before the pull tier selection below.
        if let Some(fresh) = self.store.get_calendars(&calendar.account_id).await?.into_iter().find(|c| c.id == calendar.id) {
            calendar = fresh;
        }

        if self.is_cancelled() {
            return self.record_cancelled(session).await;
        }

        if auth_error.is_none() {
            match PullStrategy::new(client, &self.store).pull_calendar(&calendar, false).await {
                Ok(PullOutcome::NoChanges) => {}
                Ok(PullOutcome::Applied(report)) => {
                    session.events_fetched += report.fetched;
                    session.events_written += report.written;
                    session.events_updated += report.updated;
                    session.events_deleted += report.deleted;
                    session.skipped_parse_error += report.skipped_parse_error;
                }
                Err(e) => {
                    if matches!(e, crate::calendar::pull::PullError::CalDav(CalDavError::Unauthorized)) {
                        auth_error = Some("unauthorized while pulling".to_string());
                    } else {
                        session.error_stage = Some("pull".to_string());
                        session.error_type = Some("Error".to_string());
                        session.error_message = Some(e.to_string());
                        session.status = SyncSessionStatus::Partial;
                    }
                }
            }
        }

        session.duration_ms = started.elapsed().as_millis() as i64;

        if let Some(reason) = &auth_error {
            session.status = SyncSessionStatus::Failed;
            session.error_type = Some("AuthError".to_string());
            session.error_message = Some(reason.clone());
            self.notifications.notify_sync_failed(calendar.id.clone(), reason.clone());
        } else if session.status == SyncSessionStatus::Success && !abandoned_titles.is_empty() {
            session.status = SyncSessionStatus::Partial;
        }

        if !abandoned_titles.is_empty() {
            self.notifications
                .notify_operations_abandoned(calendar.id.clone(), abandoned_titles);
        }

        self.store.record_sync_session(&session).await?;
        self.store
            .append_sync_log(&SyncLog::new("sync_calendar", session.status_as_str()))
            .await?;

        if let Some(reason) = auth_error {
            return Err(SyncError::Auth(reason));
        }

        Ok(session)
    }

    /// Records a `Cancelled` session and returns `SyncError::Cancelled`, per
    /// `spec.md` §5 ("the engine must be safe to interrupt at any
    /// suspension point").
    async fn record_cancelled(&self, mut session: SyncSession) -> SyncEngineResult<SyncSession> {
        session.status = SyncSessionStatus::Cancelled;
        self.store.record_sync_session(&session).await?;
        self.store
            .append_sync_log(&SyncLog::new("sync_calendar", session.status_as_str()))
            .await?;
        Err(SyncError::Cancelled)
    }

    /// Walks every `CONFLICT`-status operation for the calendar and applies
    /// `conflict_policy`, per `spec.md` §4.8. Returns the titles of any
    /// events whose conflict was abandoned (3 cycles exhausted) for the
    /// once-per-cycle notification.
    async fn resolve_conflicts(
        &self,
        client: &dyn CalDavTransport,
        calendar: &mut Calendar,
        conflict_policy: ConflictPolicy,
        session: &mut SyncSession,
    ) -> SyncEngineResult<Vec<String>> {
        let resolver = ConflictResolver::new(conflict_policy);
        let codec = CalcardCodec::new();
        let mut abandoned_titles = Vec::new();

        let conflict_ops = self.store.get_conflict_operations(&calendar.id).await?;
        for mut op in conflict_ops {
            let Some(mut event) = self.store.get_event(&op.event_id).await? else {
                self.store.delete_operation(&op.id).await?;
                continue;
            };

            if op.retry_count > MAX_CONFLICT_SYNC_CYCLES {
                abandoned_titles.push(event.title.clone());
                event.sync_status = SyncStatus::Synced;
                self.store.upsert_event(&event).await?;
                self.store.update_sync_tokens(&calendar.id, None, None).await?;
                calendar.ctag = None;
                calendar.sync_token = None;
                self.store.delete_operation(&op.id).await?;
                continue;
            }

            let mut server_etag = None;
            let mut server_modified_at = None;
            if let Some(href) = &event.caldav_url {
                if let Ok(items) = client.fetch_events_by_href(&calendar.remote_url, std::slice::from_ref(href)).await {
                    if let Some(item) = items.first() {
                        server_etag = item.etag.clone();
                        if let Ok(parsed) = codec.parse(&item.ical_text, &calendar.id) {
                            server_modified_at = parsed.events.first().map(|e| e.dtstamp);
                        }
                    }
                }
            }

            match resolver.resolve(&event, server_modified_at) {
                ResolutionResult::Resolved => {
                    resolver.apply_server_wins(&mut event, server_etag);
                    self.store.upsert_event(&event).await?;
                    self.store.update_sync_tokens(&calendar.id, None, None).await?;
                    calendar.ctag = None;
                    calendar.sync_token = None;
                    self.store.delete_operation(&op.id).await?;
                    session.conflicts_resolved += 1;
                }
                ResolutionResult::Retried => {
                    // The re-queued push must carry the server's current
                    // etag, or the retried PUT's If-Match repeats the stale
                    // value that produced this 412 and conflicts forever. A
                    // missing server_etag (the refetch above failed) leaves
                    // the event's existing etag alone rather than wiping it.
                    if let Some(etag) = server_etag {
                        event.etag = Some(etag);
                        self.store.upsert_event(&event).await?;
                    }
                    op.status = PendingOperationStatus::Pending;
                    op.next_retry_at = None;
                    self.store.update_operation(&op).await?;
                    session.conflicts_resolved += 1;
                }
                ResolutionResult::Failed => {
                    // Stays CONFLICT; counted on a later cycle once
                    // `retry_count` (the conflict-cycle counter) exceeds
                    // MAX_CONFLICT_SYNC_CYCLES above.
                    warn!(event_id = %event.id, "conflict could not be resolved this cycle");
                }
            }
        }

        Ok(abandoned_titles)
    }

    /// Iterates every `syncs_via_caldav()` account's calendars, skipping
    /// push for read-only ones, and folds the per-calendar results into one
    /// `SyncResult`. At most one `sync_account` runs per account at a time;
    /// a concurrent call observes `AlreadySyncing`.
    pub async fn sync_account(
        &self,
        client: &dyn CalDavTransport,
        account: &Account,
        conflict_policy: ConflictPolicy,
        trigger_source: &str,
    ) -> SyncResult {
        if !account.provider.syncs_via_caldav() {
            return SyncResult::Success;
        }

        let lock = self.lock_for_account(&account.id).await;
        let Ok(_guard) = lock.try_lock() else {
            info!(account_id = %account.id, "sync already in progress for this account, skipping");
            return SyncResult::Success;
        };

        let calendars = match self.store.get_calendars(&account.id).await {
            Ok(c) => c,
            Err(e) => return SyncResult::Error(e.to_string()),
        };

        let mut errors = Vec::new();
        for calendar in &calendars {
            match self.sync_calendar(client, calendar, conflict_policy, trigger_source).await {
                Ok(_) => {}
                Err(SyncError::Auth(reason)) => {
                    // §4.9: a 401 short-circuits the whole account, no
                    // further calendars are attempted.
                    return SyncResult::AuthError(reason);
                }
                Err(e) => errors.push(format!("{}: {e}", calendar.display_name)),
            }
        }

        if errors.is_empty() {
            SyncResult::Success
        } else if errors.len() == calendars.len() {
            SyncResult::Error(errors.join("; "))
        } else {
            SyncResult::PartialSuccess(errors)
        }
    }
}

impl SyncSession {
    fn status_as_str(&self) -> &'static str {
        match self.status {
            SyncSessionStatus::Success => "SUCCESS",
            SyncSessionStatus::Partial => "PARTIAL",
            SyncSessionStatus::Failed => "FAILED",
            SyncSessionStatus::Cancelled => "CANCELLED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::client::CalDavClient;
    use crate::calendar::model::AccountProvider;

    #[tokio::test]
    async fn local_account_never_enters_the_sync_pipeline() {
        let store = Arc::new(Store::new_in_memory().await.unwrap());
        let notifications = Arc::new(CalendarNotificationManager::new());
        let engine = SyncEngine::new(store, notifications);

        let account = Account::new(AccountProvider::Local, "local@example.com".into(), "Local".into());
        assert!(!account.provider.syncs_via_caldav());

        let quirks = Arc::new(crate::calendar::quirks::DefaultQuirks::new("https://dav.example.com".into()));
        let client = CalDavClient::new("https://dav.example.com".into(), "u".into(), "p".into(), quirks).unwrap();
        let result = engine.sync_account(&client, &account, ConflictPolicy::default(), "manual").await;
        assert!(matches!(result, SyncResult::Success));
    }

    #[tokio::test]
    async fn a_tripped_cancellation_flag_short_circuits_before_any_push() {
        let store = Arc::new(Store::new_in_memory().await.unwrap());
        let notifications = Arc::new(CalendarNotificationManager::new());
        let (_tx, rx) = tokio::sync::watch::channel(true);
        let engine = SyncEngine::new(store.clone(), notifications).with_cancellation(rx);

        let account = Account::new(AccountProvider::CalDav, "a@example.com".into(), "A".into());
        store.upsert_account(&account).await.unwrap();
        let calendar = Calendar::new(account.id.clone(), "https://dav/a/".into(), "A".into());
        store.upsert_calendar(&calendar).await.unwrap();

        let fake = crate::calendar::test_support::FakeCalDavClient::new();
        let result = engine.sync_calendar(&fake, &calendar, ConflictPolicy::default(), "manual").await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
