//! `PushStrategy`: drains `PendingQueue`'s ready operations for one calendar,
//! dispatching each CREATE/UPDATE/DELETE/MOVE to `CalDavClient` and folding
//! the HTTP result back into the operation's retry state.

use crate::calendar::client::{CalDavError, CalDavTransport};
use crate::calendar::ical::{CalcardCodec, IcalCodec};
use crate::calendar::model::{Event, MovePhase, PendingOperation, PendingOperationKind, SyncStatus};
use crate::calendar::queue::PendingQueue;
use crate::calendar::store::{Store, StoreError};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PushError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// 401 at any stage short-circuits the calendar's push loop entirely,
    /// per `spec.md` §4.6 ("On Unauthorized: short-circuit the calendar
    /// sync with AuthError").
    #[error("unauthorized")]
    Unauthorized,
}

#[derive(Debug, Default)]
pub struct PushReport {
    pub created: u32,
    pub updated: u32,
    pub deleted: u32,
    pub conflicts: u32,
    pub retried: u32,
    pub failed: u32,
}

pub struct PushStrategy<'a> {
    client: &'a dyn CalDavTransport,
    store: &'a Store,
    codec: CalcardCodec,
}

impl<'a> PushStrategy<'a> {
    pub fn new(client: &'a dyn CalDavTransport, store: &'a Store) -> Self {
        Self { client, store, codec: CalcardCodec::new() }
    }

    pub async fn push_calendar(&self, calendar_id: &str, calendar_url: &str, limit: i64) -> Result<PushReport, PushError> {
        let queue = PendingQueue::new(self.store);
        let mut report = PushReport::default();

        for mut op in queue.ready_operations_for_calendar(calendar_id, limit).await.map_err(PushError::Store)? {
            queue.mark_in_progress(&mut op).await.map_err(PushError::Store)?;

            let Some(event) = self.store.get_event(&op.event_id).await.map_err(PushError::Store)? else {
                // The event disappeared locally (e.g. a DELETE already
                // dropped the row); treat the operation as complete.
                self.store.delete_operation(&op.id).await.map_err(PushError::Store)?;
                continue;
            };

            let outcome = self.dispatch(calendar_url, &op, &event).await;
            match outcome {
                Ok(PushOutcome::Created(etag, url)) => {
                    let mut updated = event;
                    updated.etag = Some(etag);
                    updated.caldav_url = Some(url);
                    updated.sync_status = SyncStatus::Synced;
                    self.store.upsert_event(&updated).await.map_err(PushError::Store)?;
                    queue.mark_success(&mut op).await.map_err(PushError::Store)?;
                    report.created += 1;
                }
                Ok(PushOutcome::Updated(etag)) => {
                    let mut updated = event;
                    updated.etag = Some(etag);
                    updated.sync_status = SyncStatus::Synced;
                    self.store.upsert_event(&updated).await.map_err(PushError::Store)?;
                    queue.mark_success(&mut op).await.map_err(PushError::Store)?;
                    report.updated += 1;
                }
                Ok(PushOutcome::Deleted) => {
                    if op.kind != PendingOperationKind::Move {
                        self.store.delete_event(&event.id, &event.calendar_id).await.map_err(PushError::Store)?;
                    }
                    queue.mark_success(&mut op).await.map_err(PushError::Store)?;
                    report.deleted += 1;
                }
                Ok(PushOutcome::MoveSourceDeleted) => {
                    // Phase 0 succeeded: the event now belongs to the
                    // target calendar and awaits its CREATE there. Flip
                    // both fields before `mark_success` advances the
                    // operation to `MovePhase::CreateInTarget`, so the next
                    // `ready_operations()` poll for the target calendar
                    // picks it up.
                    if let Some(target_calendar_id) = &op.target_calendar_id {
                        let mut moved = event;
                        moved.calendar_id = target_calendar_id.clone();
                        moved.sync_status = SyncStatus::PendingCreate;
                        moved.caldav_url = None;
                        moved.etag = None;
                        self.store.upsert_event(&moved).await.map_err(PushError::Store)?;
                    }
                    queue.mark_success(&mut op).await.map_err(PushError::Store)?;
                    report.deleted += 1;
                }
                Err(CalDavError::Unauthorized) => {
                    // Leave the operation IN_PROGRESS -> the next `getReady()`
                    // or startup reset flips it back to PENDING (spec.md §5
                    // "Cancellation never leaves a pending operation in
                    // IN_PROGRESS"); here it's an auth short-circuit rather
                    // than a cancellation, but the same recovery applies.
                    op.status = crate::calendar::model::PendingOperationStatus::Pending;
                    self.store.update_operation(&op).await.map_err(PushError::Store)?;
                    return Err(PushError::Unauthorized);
                }
                Err(CalDavError::Conflict) => {
                    queue.mark_conflict(&mut op).await.map_err(PushError::Store)?;
                    let mut conflicted = event;
                    conflicted.sync_status = SyncStatus::Conflict;
                    self.store.upsert_event(&conflicted).await.map_err(PushError::Store)?;
                    report.conflicts += 1;
                }
                Err(err) if err.is_retryable() => {
                    warn!(event_id = %op.event_id, error = %err, "push failed, retrying with backoff");
                    queue.mark_failed(&mut op).await.map_err(PushError::Store)?;
                    report.retried += 1;
                }
                Err(err) => {
                    warn!(event_id = %op.event_id, error = %err, "push failed permanently");
                    queue.mark_failed(&mut op).await.map_err(PushError::Store)?;
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn dispatch(
        &self,
        calendar_url: &str,
        op: &PendingOperation,
        event: &Event,
    ) -> Result<PushOutcome, CalDavError> {
        match op.kind {
            PendingOperationKind::Create => {
                let ical = self.codec.generate(event);
                let filename = format!("{}.ics", Uuid::new_v4());
                let url = event.caldav_url.clone().unwrap_or_else(|| self.client.event_url_for(calendar_url, &filename));
                let etag = self.client.put_event(&url, &ical, None, true).await?;
                Ok(PushOutcome::Created(etag, url))
            }
            PendingOperationKind::Update => {
                let ical = self.codec.generate(event);
                let url = event.caldav_url.clone().ok_or(CalDavError::Http {
                    status: 0,
                    message: "event has no caldav_url to PUT to".to_string(),
                })?;
                let etag = self.client.put_event(&url, &ical, event.etag.as_deref(), false).await?;
                Ok(PushOutcome::Updated(etag))
            }
            PendingOperationKind::Delete => {
                let url = op.target_url.clone().or_else(|| event.caldav_url.clone()).ok_or(CalDavError::Http {
                    status: 0,
                    message: "delete operation has no target url".to_string(),
                })?;
                self.client.delete_event(&url, event.etag.as_deref()).await?;
                Ok(PushOutcome::Deleted)
            }
            PendingOperationKind::Move => match op.move_phase {
                Some(MovePhase::DeleteFromSource) | None => {
                    let url = event.caldav_url.clone().ok_or(CalDavError::Http {
                        status: 0,
                        message: "move source has no caldav_url".to_string(),
                    })?;
                    self.client.delete_event(&url, event.etag.as_deref()).await?;
                    info!(event_id = %event.id, "move phase 1 (delete from source) complete");
                    Ok(PushOutcome::MoveSourceDeleted)
                }
                Some(MovePhase::CreateInTarget) => {
                    let ical = self.codec.generate(event);
                    let filename = format!("{}.ics", Uuid::new_v4());
                    let url = self.client.event_url_for(calendar_url, &filename);
                    let etag = self.client.put_event(&url, &ical, None, true).await?;
                    Ok(PushOutcome::Created(etag, url))
                }
            },
        }
    }
}

enum PushOutcome {
    Created(String, String),
    Updated(String),
    Deleted,
    MoveSourceDeleted,
}
