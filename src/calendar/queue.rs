//! `PendingQueue`: owns the retry/backoff/lifetime state machine for queued
//! mutations. `Store` only persists rows; every transition through
//! `PENDING -> IN_PROGRESS -> {PENDING, FAILED, CONFLICT}` and the 24h/30d
//! time-based resets live here.

use crate::calendar::model::{MovePhase, PendingOperation, PendingOperationKind, PendingOperationStatus, MAX_RETRIES};
use crate::calendar::store::{Store, StoreError};
use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type QueueResult<T> = Result<T, QueueError>;

const BASE_BACKOFF_SECS: i64 = 30;
const MAX_BACKOFF_SECS: i64 = 5 * 60 * 60;
const FAILED_RESET_AFTER: Duration = Duration::hours(24);
const ABANDON_AFTER: Duration = Duration::days(30);

/// `30s * 2^retryCount`, capped at 5h.
pub fn backoff_duration(retry_count: u32) -> Duration {
    let secs = BASE_BACKOFF_SECS.saturating_mul(1i64.checked_shl(retry_count).unwrap_or(i64::MAX).max(1));
    Duration::seconds(secs.min(MAX_BACKOFF_SECS))
}

pub struct PendingQueue<'a> {
    store: &'a Store,
}

impl<'a> PendingQueue<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn enqueue_create(&self, event_id: String, target_calendar_id: String) -> QueueResult<PendingOperation> {
        self.enqueue(event_id, PendingOperationKind::Create, None, Some(target_calendar_id), None).await
    }

    pub async fn enqueue_update(&self, event_id: String) -> QueueResult<PendingOperation> {
        self.enqueue(event_id, PendingOperationKind::Update, None, None, None).await
    }

    pub async fn enqueue_delete(&self, event_id: String, target_url: String) -> QueueResult<PendingOperation> {
        self.enqueue(event_id, PendingOperationKind::Delete, Some(target_url), None, None).await
    }

    /// A MOVE is recorded as a single operation carrying both calendar ids;
    /// `push.rs` drives it through `MovePhase::DeleteFromSource` then
    /// `MovePhase::CreateInTarget` rather than splitting it into two rows.
    pub async fn enqueue_move(
        &self,
        event_id: String,
        source_calendar_id: String,
        target_calendar_id: String,
    ) -> QueueResult<PendingOperation> {
        let mut op = self.enqueue(event_id, PendingOperationKind::Move, None, Some(target_calendar_id), Some(source_calendar_id)).await?;
        op.move_phase = Some(MovePhase::DeleteFromSource);
        self.store.update_operation(&op).await?;
        Ok(op)
    }

    async fn enqueue(
        &self,
        event_id: String,
        kind: PendingOperationKind,
        target_url: Option<String>,
        target_calendar_id: Option<String>,
        source_calendar_id: Option<String>,
    ) -> QueueResult<PendingOperation> {
        let now = Utc::now();
        let op = PendingOperation {
            id: Uuid::new_v4().to_string(),
            event_id,
            kind,
            status: PendingOperationStatus::Pending,
            retry_count: 0,
            max_retries: MAX_RETRIES,
            next_retry_at: None,
            target_url,
            target_calendar_id,
            source_calendar_id,
            move_phase: None,
            lifetime_reset_at: now,
            failed_at: None,
            created_at: now,
        };
        self.store.enqueue_operation(&op).await?;
        Ok(op)
    }

    pub async fn ready_operations(&self, limit: i64) -> QueueResult<Vec<PendingOperation>> {
        Ok(self.store.get_ready_operations(Utc::now(), limit).await?)
    }

    pub async fn ready_operations_for_calendar(&self, calendar_id: &str, limit: i64) -> QueueResult<Vec<PendingOperation>> {
        Ok(self.store.get_ready_operations_for_calendar(calendar_id, Utc::now(), limit).await?)
    }

    pub async fn mark_in_progress(&self, op: &mut PendingOperation) -> QueueResult<()> {
        op.status = PendingOperationStatus::InProgress;
        self.store.update_operation(op).await?;
        Ok(())
    }

    /// A non-MOVE operation, or the second phase of a MOVE, is simply
    /// deleted on success. The first MOVE phase re-enqueues the same row at
    /// `CreateInTarget` rather than finishing it.
    pub async fn mark_success(&self, op: &mut PendingOperation) -> QueueResult<()> {
        if op.kind == PendingOperationKind::Move && op.move_phase == Some(MovePhase::DeleteFromSource) {
            op.move_phase = Some(MovePhase::CreateInTarget);
            op.status = PendingOperationStatus::Pending;
            op.retry_count = 0;
            op.next_retry_at = None;
            self.store.update_operation(op).await?;
            return Ok(());
        }
        self.store.delete_operation(&op.id).await?;
        Ok(())
    }

    /// Retryable failure: bump `retry_count`, schedule `next_retry_at` via
    /// the exponential backoff schedule, and flip to `FAILED` once
    /// `retry_count` exceeds `max_retries` (still eligible for the 24h
    /// auto-reset, just no longer polled as `PENDING`).
    pub async fn mark_failed(&self, op: &mut PendingOperation) -> QueueResult<()> {
        op.retry_count += 1;
        if op.retry_count > op.max_retries {
            op.status = PendingOperationStatus::Failed;
            op.failed_at = Some(Utc::now());
            warn!(event_id = %op.event_id, "pending operation exhausted retries, marked FAILED");
        } else {
            op.status = PendingOperationStatus::Pending;
            op.next_retry_at = Some(Utc::now() + backoff_duration(op.retry_count));
        }
        self.store.update_operation(op).await?;
        Ok(())
    }

    /// A non-retryable server rejection (e.g. a 412 the push strategy could
    /// not auto-resolve) moves straight to `CONFLICT`, bypassing backoff.
    /// `retry_count` doubles as the conflict-cycle counter here: `SyncEngine`
    /// abandons the operation once it exceeds `MAX_CONFLICT_SYNC_CYCLES`.
    pub async fn mark_conflict(&self, op: &mut PendingOperation) -> QueueResult<()> {
        op.status = PendingOperationStatus::Conflict;
        op.retry_count += 1;
        self.store.update_operation(op).await?;
        Ok(())
    }

    /// Run once per sync cycle: `FAILED` rows older than 24h return to
    /// `PENDING` with a reset retry counter, and rows whose
    /// `lifetime_reset_at` is older than 30 days are abandoned outright
    /// (deleted, never retried again). Abandonment also returns the event to
    /// `SYNCED` (so the next pull overwrites it) and clears the calendar's
    /// `ctag` to force a full pull, per `spec.md` §4.5.
    pub async fn sweep(&self, calendar_id: &str) -> QueueResult<SweepOutcome> {
        let now = Utc::now();
        let mut outcome = SweepOutcome::default();
        let ops = self.store.get_operations_for_calendar(calendar_id).await?;
        for mut op in ops {
            if now - op.lifetime_reset_at > ABANDON_AFTER {
                info!(event_id = %op.event_id, "pending operation abandoned after 30 day lifetime");
                if let Some(mut event) = self.store.get_event(&op.event_id).await? {
                    event.sync_status = crate::calendar::model::SyncStatus::Synced;
                    self.store.upsert_event(&event).await?;
                    outcome.abandoned_titles.push(event.title);
                }
                self.store.delete_operation(&op.id).await?;
                outcome.abandoned += 1;
                continue;
            }
            if op.status == PendingOperationStatus::Failed {
                if let Some(failed_at) = op.failed_at {
                    if now - failed_at > FAILED_RESET_AFTER {
                        op.status = PendingOperationStatus::Pending;
                        op.retry_count = 0;
                        op.next_retry_at = None;
                        op.failed_at = None;
                        self.store.update_operation(&op).await?;
                        outcome.reset += 1;
                    }
                }
            }
        }
        if outcome.abandoned > 0 {
            self.store.update_sync_tokens(calendar_id, None, None).await?;
        }
        Ok(outcome)
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub reset: u32,
    pub abandoned: u32,
    pub abandoned_titles: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_five_hours() {
        assert_eq!(backoff_duration(0), Duration::seconds(30));
        assert_eq!(backoff_duration(1), Duration::seconds(60));
        assert_eq!(backoff_duration(3), Duration::seconds(240));
        assert_eq!(backoff_duration(20), Duration::seconds(MAX_BACKOFF_SECS));
    }

    #[tokio::test]
    async fn move_operation_transitions_through_two_phases() {
        let store = Store::new_in_memory().await.unwrap();
        let queue = PendingQueue::new(&store);
        let mut op = queue
            .enqueue_move("event-1".to_string(), "cal-src".to_string(), "cal-dst".to_string())
            .await
            .unwrap();
        assert_eq!(op.move_phase, Some(MovePhase::DeleteFromSource));

        queue.mark_success(&mut op).await.unwrap();
        assert_eq!(op.move_phase, Some(MovePhase::CreateInTarget));
        assert_eq!(op.status, PendingOperationStatus::Pending);

        queue.mark_success(&mut op).await.unwrap();
        assert!(store.get_operation(&op.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn repeated_failures_exhaust_retries_into_failed_status() {
        let store = Store::new_in_memory().await.unwrap();
        let queue = PendingQueue::new(&store);
        let mut op = queue.enqueue_update("event-2".to_string()).await.unwrap();
        for _ in 0..MAX_RETRIES {
            queue.mark_failed(&mut op).await.unwrap();
        }
        assert_eq!(op.status, PendingOperationStatus::Pending);
        queue.mark_failed(&mut op).await.unwrap();
        assert_eq!(op.status, PendingOperationStatus::Failed);
    }

    #[tokio::test]
    async fn sweep_resets_failed_ops_older_than_24h_and_abandons_after_30d() {
        let store = Store::new_in_memory().await.unwrap();
        let queue = PendingQueue::new(&store);

        let account = crate::calendar::model::Account::new(
            crate::calendar::model::AccountProvider::CalDav,
            "x@example.com".into(),
            "X".into(),
        );
        store.upsert_account(&account).await.unwrap();
        let calendar = crate::calendar::model::Calendar::new(account.id.clone(), "https://dav/x/".into(), "X".into());
        store.upsert_calendar(&calendar).await.unwrap();
        let event = crate::calendar::model::Event::new(calendar.id.clone(), "Stale".into(), 0, 1);
        store.upsert_event(&event).await.unwrap();

        let mut op = queue.enqueue_update(event.id.clone()).await.unwrap();
        op.status = PendingOperationStatus::Failed;
        op.failed_at = Some(Utc::now() - Duration::hours(25));
        store.update_operation(&op).await.unwrap();

        let outcome = queue.sweep(&calendar.id).await.unwrap();
        assert_eq!(outcome.reset, 1);
        let reloaded = store.get_operation(&op.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, PendingOperationStatus::Pending);
    }
}
