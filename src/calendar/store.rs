//! `Store`: the sqlx-backed persistence layer for accounts, calendars,
//! events, materialized occurrences, the pending-operation queue, and the
//! append-only session/log tables, plus a reactive change-notification
//! broadcast.
//!
//! Grounded in `calendar/database.rs`'s `CalendarDatabase` (same
//! `SqlitePool` + migration-on-connect + FTS5 shadow-table pattern), widened
//! to the full schema `SPEC_FULL.md` §3.A describes.

use crate::calendar::model::{
    Account, AccountProvider, Calendar, Event, EventClassification, EventReminder,
    EventStatus, EventTransparency, IcsSubscription, MovePhase, Occurrence, PendingOperation,
    PendingOperationKind, PendingOperationStatus, ReminderAction, SyncLog, SyncSession,
    SyncSessionStatus, SyncStatus, SyncType,
};
use chrono::{DateTime, Utc};
use serde_json;
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Emitted on every committed mutation so any number of listeners (UI layers,
/// the occurrence materializer) can react without polling.
#[derive(Debug, Clone)]
pub enum StoreChange {
    EventUpserted { calendar_id: String, event_id: String },
    EventDeleted { calendar_id: String, event_id: String },
    CalendarUpserted { calendar_id: String },
    PendingQueueChanged { event_id: String },
}

/// An occurrence paired with the event row that describes it — the
/// exception event when `exception_event_id` is set, the series master
/// otherwise. Returned by `get_occurrences_with_events_in_range`, the
/// "events for day" read path.
#[derive(Debug, Clone)]
pub struct OccurrenceWithEvent {
    pub occurrence: Occurrence,
    pub event: Event,
}

pub struct Store {
    pool: SqlitePool,
    changes: broadcast::Sender<StoreChange>,
}

impl Store {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let (tx, _rx) = broadcast::channel(1000);
        let store = Self { pool, changes: tx };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn new_in_memory() -> StoreResult<Self> {
        Self::new("sqlite::memory:").await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    fn notify(&self, change: StoreChange) {
        // No subscribers is the common case before any listener attaches;
        // the broadcast channel treats that as a non-error no-op.
        let _ = self.changes.send(change);
    }

    async fn migrate(&self) -> StoreResult<()> {
        info!("running calendar store migrations");
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                provider TEXT NOT NULL,
                email TEXT NOT NULL,
                display_name TEXT NOT NULL,
                principal_url TEXT,
                home_set_url TEXT,
                is_enabled INTEGER NOT NULL DEFAULT 1,
                UNIQUE(provider, email)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS calendars (
                id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                remote_url TEXT NOT NULL,
                display_name TEXT NOT NULL,
                color TEXT,
                is_read_only INTEGER NOT NULL DEFAULT 0,
                is_visible INTEGER NOT NULL DEFAULT 1,
                is_default INTEGER NOT NULL DEFAULT 0,
                ctag TEXT,
                sync_token TEXT,
                FOREIGN KEY(account_id) REFERENCES accounts(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                uid TEXT NOT NULL,
                calendar_id TEXT NOT NULL,
                import_id TEXT,
                title TEXT NOT NULL,
                location TEXT,
                description TEXT,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER NOT NULL,
                timezone TEXT,
                is_all_day INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'Confirmed',
                transp TEXT NOT NULL DEFAULT 'Opaque',
                classification TEXT NOT NULL DEFAULT 'Public',
                priority INTEGER,
                geo_lat REAL,
                geo_lon REAL,
                color TEXT,
                url TEXT,
                categories TEXT NOT NULL DEFAULT '[]',
                rrule TEXT,
                rdate TEXT NOT NULL DEFAULT '[]',
                exdate TEXT NOT NULL DEFAULT '[]',
                duration INTEGER,
                original_event_id TEXT,
                original_instance_time INTEGER,
                caldav_url TEXT,
                etag TEXT,
                sequence INTEGER NOT NULL DEFAULT 0,
                sync_status TEXT NOT NULL DEFAULT 'PENDING_CREATE',
                dtstamp TEXT NOT NULL,
                local_modified_at TEXT NOT NULL,
                server_modified_at TEXT,
                raw_ical TEXT,
                alarm_count INTEGER NOT NULL DEFAULT 0,
                reminders TEXT NOT NULL DEFAULT '[]',
                unknown_properties TEXT NOT NULL DEFAULT '{}',
                UNIQUE(calendar_id, uid, original_instance_time),
                FOREIGN KEY(calendar_id) REFERENCES calendars(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_calendar ON events(calendar_id)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_uid ON events(uid)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_sync_status ON events(sync_status)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS occurrences (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                calendar_id TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER NOT NULL,
                start_day INTEGER NOT NULL,
                end_day INTEGER NOT NULL,
                is_cancelled INTEGER NOT NULL DEFAULT 0,
                exception_event_id TEXT,
                UNIQUE(event_id, start_ts),
                FOREIGN KEY(event_id) REFERENCES events(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_occurrences_range ON occurrences(calendar_id, start_day, end_day)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pending_operations (
                id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 10,
                next_retry_at TEXT,
                target_url TEXT,
                target_calendar_id TEXT,
                source_calendar_id TEXT,
                move_phase INTEGER,
                lifetime_reset_at TEXT NOT NULL,
                failed_at TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY(event_id) REFERENCES events(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_pending_ops_status ON pending_operations(status, next_retry_at)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_sessions (
                id TEXT PRIMARY KEY,
                calendar_id TEXT NOT NULL,
                calendar_name TEXT NOT NULL,
                sync_type TEXT NOT NULL,
                trigger_source TEXT NOT NULL,
                start_time TEXT NOT NULL,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                events_fetched INTEGER NOT NULL DEFAULT 0,
                events_written INTEGER NOT NULL DEFAULT 0,
                events_updated INTEGER NOT NULL DEFAULT 0,
                events_deleted INTEGER NOT NULL DEFAULT 0,
                events_pushed_created INTEGER NOT NULL DEFAULT 0,
                events_pushed_updated INTEGER NOT NULL DEFAULT 0,
                events_pushed_deleted INTEGER NOT NULL DEFAULT 0,
                conflicts_resolved INTEGER NOT NULL DEFAULT 0,
                skipped_parse_error INTEGER NOT NULL DEFAULT 0,
                abandoned_parse_errors INTEGER NOT NULL DEFAULT 0,
                error_type TEXT,
                error_stage TEXT,
                error_message TEXT,
                status TEXT NOT NULL DEFAULT 'Success'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_log (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                calendar_id TEXT,
                event_uid TEXT,
                action TEXT NOT NULL,
                result TEXT NOT NULL,
                details TEXT,
                http_status INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ics_subscriptions (
                id TEXT PRIMARY KEY,
                url TEXT NOT NULL,
                name TEXT NOT NULL,
                color TEXT,
                calendar_id TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                etag TEXT,
                last_modified TEXT,
                last_sync_at TEXT,
                next_refresh_at TEXT NOT NULL,
                FOREIGN KEY(calendar_id) REFERENCES calendars(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS calendar_events_fts USING fts5(
                title, location, description, content='events', content_rowid='rowid'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS events_fts_insert AFTER INSERT ON events BEGIN
                INSERT INTO calendar_events_fts(rowid, title, location, description)
                VALUES (new.rowid, new.title, new.location, new.description);
            END
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS events_fts_delete AFTER DELETE ON events BEGIN
                INSERT INTO calendar_events_fts(calendar_events_fts, rowid, title, location, description)
                VALUES ('delete', old.rowid, old.title, old.location, old.description);
            END
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS events_fts_update AFTER UPDATE ON events BEGIN
                INSERT INTO calendar_events_fts(calendar_events_fts, rowid, title, location, description)
                VALUES ('delete', old.rowid, old.title, old.location, old.description);
                INSERT INTO calendar_events_fts(rowid, title, location, description)
                VALUES (new.rowid, new.title, new.location, new.description);
            END
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        debug!("calendar store migrations complete");
        Ok(())
    }

    // -- accounts ---------------------------------------------------------

    pub async fn upsert_account(&self, account: &Account) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, provider, email, display_name, principal_url, home_set_url, is_enabled)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                principal_url = excluded.principal_url,
                home_set_url = excluded.home_set_url,
                is_enabled = excluded.is_enabled
            "#,
        )
        .bind(&account.id)
        .bind(account.provider.as_str())
        .bind(&account.email)
        .bind(&account.display_name)
        .bind(&account.principal_url)
        .bind(&account.home_set_url)
        .bind(account.is_enabled)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_accounts(&self) -> StoreResult<Vec<Account>> {
        let rows = sqlx::query("SELECT * FROM accounts WHERE is_enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_account).collect()
    }

    // -- calendars ----------------------------------------------------------

    pub async fn upsert_calendar(&self, calendar: &Calendar) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO calendars (id, account_id, remote_url, display_name, color, is_read_only, is_visible, is_default, ctag, sync_token)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                display_name = excluded.display_name,
                color = excluded.color,
                ctag = excluded.ctag,
                sync_token = excluded.sync_token
            "#,
        )
        .bind(&calendar.id)
        .bind(&calendar.account_id)
        .bind(&calendar.remote_url)
        .bind(&calendar.display_name)
        .bind(&calendar.color)
        .bind(calendar.is_read_only)
        .bind(calendar.is_visible)
        .bind(calendar.is_default)
        .bind(&calendar.ctag)
        .bind(&calendar.sync_token)
        .execute(&self.pool)
        .await?;
        self.notify(StoreChange::CalendarUpserted { calendar_id: calendar.id.clone() });
        Ok(())
    }

    pub async fn get_calendars(&self, account_id: &str) -> StoreResult<Vec<Calendar>> {
        let rows = sqlx::query("SELECT * FROM calendars WHERE account_id = ?")
            .bind(account_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_calendar).collect()
    }

    pub async fn update_sync_tokens(&self, calendar_id: &str, ctag: Option<&str>, sync_token: Option<&str>) -> StoreResult<()> {
        sqlx::query("UPDATE calendars SET ctag = ?, sync_token = ? WHERE id = ?")
            .bind(ctag)
            .bind(sync_token)
            .bind(calendar_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- events ---------------------------------------------------------

    pub async fn upsert_event(&self, event: &Event) -> StoreResult<()> {
        let categories = serde_json::to_string(&event.categories)?;
        let rdate = serde_json::to_string(&event.rdate)?;
        let exdate = serde_json::to_string(&event.exdate)?;
        let reminders = serde_json::to_string(&event.reminders)?;
        let unknown_properties = serde_json::to_string(&event.unknown_properties)?;

        sqlx::query(
            r#"
            INSERT INTO events (
                id, uid, calendar_id, import_id, title, location, description,
                start_ts, end_ts, timezone, is_all_day, status, transp, classification,
                priority, geo_lat, geo_lon, color, url, categories, rrule, rdate, exdate,
                duration, original_event_id, original_instance_time, caldav_url, etag,
                sequence, sync_status, dtstamp, local_modified_at, server_modified_at,
                raw_ical, alarm_count, reminders, unknown_properties
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title, location = excluded.location, description = excluded.description,
                start_ts = excluded.start_ts, end_ts = excluded.end_ts, timezone = excluded.timezone,
                is_all_day = excluded.is_all_day, status = excluded.status, transp = excluded.transp,
                classification = excluded.classification, priority = excluded.priority,
                geo_lat = excluded.geo_lat, geo_lon = excluded.geo_lon, color = excluded.color,
                url = excluded.url, categories = excluded.categories, rrule = excluded.rrule,
                rdate = excluded.rdate, exdate = excluded.exdate, duration = excluded.duration,
                caldav_url = excluded.caldav_url, etag = excluded.etag, sequence = excluded.sequence,
                sync_status = excluded.sync_status, dtstamp = excluded.dtstamp,
                local_modified_at = excluded.local_modified_at, server_modified_at = excluded.server_modified_at,
                raw_ical = excluded.raw_ical, alarm_count = excluded.alarm_count,
                reminders = excluded.reminders, unknown_properties = excluded.unknown_properties
            "#,
        )
        .bind(&event.id)
        .bind(&event.uid)
        .bind(&event.calendar_id)
        .bind(&event.import_id)
        .bind(&event.title)
        .bind(&event.location)
        .bind(&event.description)
        .bind(event.start_ts)
        .bind(event.end_ts)
        .bind(&event.timezone)
        .bind(event.is_all_day)
        .bind(format!("{:?}", event.status))
        .bind(format!("{:?}", event.transp))
        .bind(format!("{:?}", event.classification))
        .bind(event.priority.map(|p| p as i64))
        .bind(event.geo_lat)
        .bind(event.geo_lon)
        .bind(&event.color)
        .bind(&event.url)
        .bind(categories)
        .bind(&event.rrule)
        .bind(rdate)
        .bind(exdate)
        .bind(event.duration)
        .bind(&event.original_event_id)
        .bind(event.original_instance_time)
        .bind(&event.caldav_url)
        .bind(&event.etag)
        .bind(event.sequence as i64)
        .bind(event.sync_status.as_str())
        .bind(event.dtstamp.to_rfc3339())
        .bind(event.local_modified_at.to_rfc3339())
        .bind(event.server_modified_at.map(|t| t.to_rfc3339()))
        .bind(&event.raw_ical)
        .bind(event.alarm_count as i64)
        .bind(reminders)
        .bind(unknown_properties)
        .execute(&self.pool)
        .await?;

        self.notify(StoreChange::EventUpserted {
            calendar_id: event.calendar_id.clone(),
            event_id: event.id.clone(),
        });
        Ok(())
    }

    pub async fn get_event(&self, id: &str) -> StoreResult<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    pub async fn get_event_by_uid(&self, calendar_id: &str, uid: &str, original_instance_time: Option<i64>) -> StoreResult<Option<Event>> {
        let row = sqlx::query(
            "SELECT * FROM events WHERE calendar_id = ? AND uid = ? AND original_instance_time IS ?",
        )
        .bind(calendar_id)
        .bind(uid)
        .bind(original_instance_time)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    pub async fn get_event_by_caldav_url(&self, calendar_id: &str, caldav_url: &str) -> StoreResult<Option<Event>> {
        let row = sqlx::query("SELECT * FROM events WHERE calendar_id = ? AND caldav_url = ?")
            .bind(calendar_id)
            .bind(caldav_url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_event).transpose()
    }

    pub async fn get_events_for_calendar(&self, calendar_id: &str) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events WHERE calendar_id = ?")
            .bind(calendar_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn get_events_with_status(&self, calendar_id: &str, status: SyncStatus) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query("SELECT * FROM events WHERE calendar_id = ? AND sync_status = ?")
            .bind(calendar_id)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_event).collect()
    }

    pub async fn delete_event(&self, id: &str, calendar_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM events WHERE id = ?").bind(id).execute(&self.pool).await?;
        self.notify(StoreChange::EventDeleted { calendar_id: calendar_id.to_string(), event_id: id.to_string() });
        Ok(())
    }

    pub async fn search_events(&self, query: &str, limit: i64) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT e.* FROM events e
            JOIN calendar_events_fts fts ON e.rowid = fts.rowid
            WHERE calendar_events_fts MATCH ?
            ORDER BY e.start_ts
            LIMIT ?
            "#,
        )
        .bind(query)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_event).collect()
    }

    // -- occurrences ------------------------------------------------------

    pub async fn replace_occurrences(&self, event_id: &str, occurrences: &[Occurrence]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM occurrences WHERE event_id = ?")
            .bind(event_id)
            .execute(&mut *tx)
            .await?;
        for occ in occurrences {
            sqlx::query(
                r#"
                INSERT INTO occurrences (id, event_id, calendar_id, start_ts, end_ts, start_day, end_day, is_cancelled, exception_event_id)
                VALUES (?,?,?,?,?,?,?,?,?)
                "#,
            )
            .bind(&occ.id)
            .bind(&occ.event_id)
            .bind(&occ.calendar_id)
            .bind(occ.start_ts)
            .bind(occ.end_ts)
            .bind(occ.start_day)
            .bind(occ.end_day)
            .bind(occ.is_cancelled)
            .bind(&occ.exception_event_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Insert-or-replace a single occurrence row, used by
    /// `OccurrenceMaterializer::link_exception` when the recurring series
    /// doesn't itself emit the instant a modified exception targets.
    pub async fn upsert_occurrence(&self, occ: &Occurrence) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO occurrences (id, event_id, calendar_id, start_ts, end_ts, start_day, end_day, is_cancelled, exception_event_id)
            VALUES (?,?,?,?,?,?,?,?,?)
            ON CONFLICT(event_id, start_ts) DO UPDATE SET
                end_ts = excluded.end_ts,
                end_day = excluded.end_day,
                is_cancelled = excluded.is_cancelled,
                exception_event_id = excluded.exception_event_id
            "#,
        )
        .bind(&occ.id)
        .bind(&occ.event_id)
        .bind(&occ.calendar_id)
        .bind(occ.start_ts)
        .bind(occ.end_ts)
        .bind(occ.start_day)
        .bind(occ.end_day)
        .bind(occ.is_cancelled)
        .bind(&occ.exception_event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All occurrences for one event, including cancelled ones — used by the
    /// materializer, which needs to see EXDATE-cancelled slots that the
    /// "events for day" read path (`get_occurrences_in_range`) filters out.
    pub async fn get_occurrences_for_event(&self, event_id: &str) -> StoreResult<Vec<Occurrence>> {
        let rows = sqlx::query("SELECT * FROM occurrences WHERE event_id = ? ORDER BY start_ts")
            .bind(event_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_occurrence).collect()
    }

    pub async fn get_occurrences_in_range(&self, calendar_id: &str, start_day: u32, end_day: u32) -> StoreResult<Vec<Occurrence>> {
        let rows = sqlx::query(
            "SELECT * FROM occurrences WHERE calendar_id = ? AND start_day <= ? AND end_day >= ? AND is_cancelled = 0 ORDER BY start_ts",
        )
        .bind(calendar_id)
        .bind(end_day)
        .bind(start_day)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_occurrence).collect()
    }

    /// The "events for day" read path: every non-cancelled occurrence in
    /// range, joined to the event row that actually describes it — the
    /// exception event at `exceptionEventId` when one overrides this
    /// instance, the series master at `event_id` otherwise, per `spec.md`
    /// §4.10. An occurrence whose event row is missing (a dangling
    /// `event_id` left behind by a delete that hasn't swept its occurrences
    /// yet) is silently skipped rather than failing the whole range.
    pub async fn get_occurrences_with_events_in_range(
        &self,
        calendar_id: &str,
        start_day: u32,
        end_day: u32,
    ) -> StoreResult<Vec<OccurrenceWithEvent>> {
        let occurrences = self.get_occurrences_in_range(calendar_id, start_day, end_day).await?;
        let mut results = Vec::with_capacity(occurrences.len());
        for occurrence in occurrences {
            let event_id = occurrence.exception_event_id.as_deref().unwrap_or(&occurrence.event_id);
            if let Some(event) = self.get_event(event_id).await? {
                results.push(OccurrenceWithEvent { occurrence, event });
            }
        }
        Ok(results)
    }

    // -- pending operations -----------------------------------------------

    pub async fn enqueue_operation(&self, op: &PendingOperation) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_operations (
                id, event_id, kind, status, retry_count, max_retries, next_retry_at,
                target_url, target_calendar_id, source_calendar_id, move_phase,
                lifetime_reset_at, failed_at, created_at
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(&op.id)
        .bind(&op.event_id)
        .bind(op.kind.as_str())
        .bind(op.status.as_str())
        .bind(op.retry_count as i64)
        .bind(op.max_retries as i64)
        .bind(op.next_retry_at.map(|t| t.to_rfc3339()))
        .bind(&op.target_url)
        .bind(&op.target_calendar_id)
        .bind(&op.source_calendar_id)
        .bind(op.move_phase.map(|p| p as i64))
        .bind(op.lifetime_reset_at.to_rfc3339())
        .bind(op.failed_at.map(|t| t.to_rfc3339()))
        .bind(op.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        self.notify(StoreChange::PendingQueueChanged { event_id: op.event_id.clone() });
        Ok(())
    }

    pub async fn update_operation(&self, op: &PendingOperation) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE pending_operations SET
                status = ?, retry_count = ?, next_retry_at = ?, move_phase = ?,
                lifetime_reset_at = ?, failed_at = ?, target_url = ?, target_calendar_id = ?
            WHERE id = ?
            "#,
        )
        .bind(op.status.as_str())
        .bind(op.retry_count as i64)
        .bind(op.next_retry_at.map(|t| t.to_rfc3339()))
        .bind(op.move_phase.map(|p| p as i64))
        .bind(op.lifetime_reset_at.to_rfc3339())
        .bind(op.failed_at.map(|t| t.to_rfc3339()))
        .bind(&op.target_url)
        .bind(&op.target_calendar_id)
        .bind(&op.id)
        .execute(&self.pool)
        .await?;
        self.notify(StoreChange::PendingQueueChanged { event_id: op.event_id.clone() });
        Ok(())
    }

    pub async fn delete_operation(&self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM pending_operations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_operation(&self, id: &str) -> StoreResult<Option<PendingOperation>> {
        let row = sqlx::query("SELECT * FROM pending_operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_operation).transpose()
    }

    /// Operations for events whose `calendar_id` matches `target_calendar_id`
    /// rather than the event's own calendar — used by `ConflictResolver` to
    /// avoid the legacy cross-calendar-bleed bug (see DESIGN.md Open Question 3).
    pub async fn get_operations_for_calendar(&self, calendar_id: &str) -> StoreResult<Vec<PendingOperation>> {
        let rows = sqlx::query(
            r#"
            SELECT po.* FROM pending_operations po
            JOIN events e ON e.id = po.event_id
            WHERE e.calendar_id = ?
            "#,
        )
        .bind(calendar_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_operation).collect()
    }

    pub async fn get_ready_operations(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<PendingOperation>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM pending_operations
            WHERE status = 'PENDING' AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_operation).collect()
    }

    /// Ready operations scoped to one calendar, via the event's *current*
    /// `calendar_id` (which a MOVE's phase-0 success already flips to the
    /// target). `PushStrategy::push_calendar` relies on this scoping so a
    /// multi-calendar sync never PUTs one calendar's event body at another
    /// calendar's collection URL.
    pub async fn get_ready_operations_for_calendar(
        &self,
        calendar_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> StoreResult<Vec<PendingOperation>> {
        let rows = sqlx::query(
            r#"
            SELECT po.* FROM pending_operations po
            JOIN events e ON e.id = po.event_id
            WHERE e.calendar_id = ?
              AND po.status = 'PENDING'
              AND (po.next_retry_at IS NULL OR po.next_retry_at <= ?)
            ORDER BY po.created_at
            LIMIT ?
            "#,
        )
        .bind(calendar_id)
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_operation).collect()
    }

    pub async fn get_conflict_operations(&self, calendar_id: &str) -> StoreResult<Vec<PendingOperation>> {
        let rows = sqlx::query(
            r#"
            SELECT po.* FROM pending_operations po
            JOIN events e ON e.id = po.event_id
            WHERE e.calendar_id = ? AND po.status = 'CONFLICT'
            "#,
        )
        .bind(calendar_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_operation).collect()
    }

    // -- sync sessions / log ------------------------------------------------

    pub async fn record_sync_session(&self, session: &SyncSession) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_sessions (
                id, calendar_id, calendar_name, sync_type, trigger_source, start_time, duration_ms,
                events_fetched, events_written, events_updated, events_deleted,
                events_pushed_created, events_pushed_updated, events_pushed_deleted,
                conflicts_resolved, skipped_parse_error, abandoned_parse_errors,
                error_type, error_stage, error_message, status
            ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(&session.id)
        .bind(&session.calendar_id)
        .bind(&session.calendar_name)
        .bind(format!("{:?}", session.sync_type))
        .bind(&session.trigger_source)
        .bind(session.start_time.to_rfc3339())
        .bind(session.duration_ms)
        .bind(session.events_fetched as i64)
        .bind(session.events_written as i64)
        .bind(session.events_updated as i64)
        .bind(session.events_deleted as i64)
        .bind(session.events_pushed_created as i64)
        .bind(session.events_pushed_updated as i64)
        .bind(session.events_pushed_deleted as i64)
        .bind(session.conflicts_resolved as i64)
        .bind(session.skipped_parse_error as i64)
        .bind(session.abandoned_parse_errors as i64)
        .bind(&session.error_type)
        .bind(&session.error_stage)
        .bind(&session.error_message)
        .bind(format!("{:?}", session.status))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn append_sync_log(&self, log: &SyncLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_log (id, timestamp, calendar_id, event_uid, action, result, details, http_status)
            VALUES (?,?,?,?,?,?,?,?)
            "#,
        )
        .bind(&log.id)
        .bind(log.timestamp.to_rfc3339())
        .bind(&log.calendar_id)
        .bind(&log.event_uid)
        .bind(&log.action)
        .bind(&log.result)
        .bind(&log.details)
        .bind(log.http_status.map(|s| s as i64))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- ICS subscriptions --------------------------------------------------

    pub async fn upsert_ics_subscription(&self, sub: &IcsSubscription) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ics_subscriptions (id, url, name, color, calendar_id, enabled, etag, last_modified, last_sync_at, next_refresh_at)
            VALUES (?,?,?,?,?,?,?,?,?,?)
            ON CONFLICT(id) DO UPDATE SET
                etag = excluded.etag, last_modified = excluded.last_modified,
                last_sync_at = excluded.last_sync_at, next_refresh_at = excluded.next_refresh_at,
                enabled = excluded.enabled
            "#,
        )
        .bind(&sub.id)
        .bind(&sub.url)
        .bind(&sub.name)
        .bind(&sub.color)
        .bind(&sub.calendar_id)
        .bind(sub.enabled)
        .bind(&sub.etag)
        .bind(&sub.last_modified)
        .bind(sub.last_sync_at.map(|t| t.to_rfc3339()))
        .bind(sub.next_refresh_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_due_ics_subscriptions(&self, now: DateTime<Utc>) -> StoreResult<Vec<IcsSubscription>> {
        let rows = sqlx::query("SELECT * FROM ics_subscriptions WHERE enabled = 1 AND next_refresh_at <= ?")
            .bind(now.to_rfc3339())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_ics_subscription).collect()
    }
}

fn parse_dt(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_account(row: &SqliteRow) -> StoreResult<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        provider: AccountProvider::from_str(row.try_get::<String, _>("provider")?.as_str())
            .unwrap_or(AccountProvider::Local),
        email: row.try_get("email")?,
        display_name: row.try_get("display_name")?,
        principal_url: row.try_get("principal_url")?,
        home_set_url: row.try_get("home_set_url")?,
        is_enabled: row.try_get("is_enabled")?,
    })
}

fn row_to_calendar(row: &SqliteRow) -> StoreResult<Calendar> {
    Ok(Calendar {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        remote_url: row.try_get("remote_url")?,
        display_name: row.try_get("display_name")?,
        color: row.try_get("color")?,
        is_read_only: row.try_get("is_read_only")?,
        is_visible: row.try_get("is_visible")?,
        is_default: row.try_get("is_default")?,
        ctag: row.try_get("ctag")?,
        sync_token: row.try_get("sync_token")?,
    })
}

fn row_to_event(row: &SqliteRow) -> StoreResult<Event> {
    let categories: String = row.try_get("categories")?;
    let rdate: String = row.try_get("rdate")?;
    let exdate: String = row.try_get("exdate")?;
    let reminders: String = row.try_get("reminders")?;
    let unknown_properties: String = row.try_get("unknown_properties")?;
    let status: String = row.try_get("status")?;
    let transp: String = row.try_get("transp")?;
    let classification: String = row.try_get("classification")?;
    let sync_status: String = row.try_get("sync_status")?;
    let dtstamp: String = row.try_get("dtstamp")?;
    let local_modified_at: String = row.try_get("local_modified_at")?;
    let server_modified_at: Option<String> = row.try_get("server_modified_at")?;
    let priority: Option<i64> = row.try_get("priority")?;

    Ok(Event {
        id: row.try_get("id")?,
        uid: row.try_get("uid")?,
        calendar_id: row.try_get("calendar_id")?,
        import_id: row.try_get("import_id")?,
        title: row.try_get("title")?,
        location: row.try_get("location")?,
        description: row.try_get("description")?,
        start_ts: row.try_get("start_ts")?,
        end_ts: row.try_get("end_ts")?,
        timezone: row.try_get("timezone")?,
        is_all_day: row.try_get("is_all_day")?,
        status: parse_status(&status),
        transp: parse_transp(&transp),
        classification: parse_classification(&classification),
        priority: priority.map(|p| p as u8),
        geo_lat: row.try_get("geo_lat")?,
        geo_lon: row.try_get("geo_lon")?,
        color: row.try_get("color")?,
        url: row.try_get("url")?,
        categories: serde_json::from_str(&categories).unwrap_or_default(),
        rrule: row.try_get("rrule")?,
        rdate: serde_json::from_str(&rdate).unwrap_or_default(),
        exdate: serde_json::from_str(&exdate).unwrap_or_default(),
        duration: row.try_get("duration")?,
        original_event_id: row.try_get("original_event_id")?,
        original_instance_time: row.try_get("original_instance_time")?,
        caldav_url: row.try_get("caldav_url")?,
        etag: row.try_get("etag")?,
        sequence: row.try_get::<i64, _>("sequence")? as u32,
        sync_status: SyncStatus::from_str(&sync_status),
        dtstamp: parse_dt(&dtstamp),
        local_modified_at: parse_dt(&local_modified_at),
        server_modified_at: server_modified_at.map(|v| parse_dt(&v)),
        raw_ical: row.try_get("raw_ical")?,
        alarm_count: row.try_get::<i64, _>("alarm_count")? as u32,
        reminders: serde_json::from_str::<Vec<EventReminder>>(&reminders).unwrap_or_default(),
        unknown_properties: serde_json::from_str::<HashMap<String, String>>(&unknown_properties).unwrap_or_default(),
    })
}

fn parse_status(value: &str) -> EventStatus {
    match value {
        "Tentative" => EventStatus::Tentative,
        "Cancelled" => EventStatus::Cancelled,
        _ => EventStatus::Confirmed,
    }
}

fn parse_transp(value: &str) -> EventTransparency {
    match value {
        "Transparent" => EventTransparency::Transparent,
        _ => EventTransparency::Opaque,
    }
}

fn parse_classification(value: &str) -> EventClassification {
    match value {
        "Private" => EventClassification::Private,
        "Confidential" => EventClassification::Confidential,
        _ => EventClassification::Public,
    }
}

fn row_to_occurrence(row: &SqliteRow) -> StoreResult<Occurrence> {
    Ok(Occurrence {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        calendar_id: row.try_get("calendar_id")?,
        start_ts: row.try_get("start_ts")?,
        end_ts: row.try_get("end_ts")?,
        start_day: row.try_get::<i64, _>("start_day")? as u32,
        end_day: row.try_get::<i64, _>("end_day")? as u32,
        is_cancelled: row.try_get("is_cancelled")?,
        exception_event_id: row.try_get("exception_event_id")?,
    })
}

fn row_to_operation(row: &SqliteRow) -> StoreResult<PendingOperation> {
    let next_retry_at: Option<String> = row.try_get("next_retry_at")?;
    let failed_at: Option<String> = row.try_get("failed_at")?;
    let move_phase: Option<i64> = row.try_get("move_phase")?;
    let lifetime_reset_at: String = row.try_get("lifetime_reset_at")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(PendingOperation {
        id: row.try_get("id")?,
        event_id: row.try_get("event_id")?,
        kind: PendingOperationKind::from_str(&row.try_get::<String, _>("kind")?),
        status: PendingOperationStatus::from_str(&row.try_get::<String, _>("status")?),
        retry_count: row.try_get::<i64, _>("retry_count")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        next_retry_at: next_retry_at.map(|v| parse_dt(&v)),
        target_url: row.try_get("target_url")?,
        target_calendar_id: row.try_get("target_calendar_id")?,
        source_calendar_id: row.try_get("source_calendar_id")?,
        move_phase: move_phase.map(|p| if p == 0 { MovePhase::DeleteFromSource } else { MovePhase::CreateInTarget }),
        lifetime_reset_at: parse_dt(&lifetime_reset_at),
        failed_at: failed_at.map(|v| parse_dt(&v)),
        created_at: parse_dt(&created_at),
    })
}

fn row_to_ics_subscription(row: &SqliteRow) -> StoreResult<IcsSubscription> {
    let last_sync_at: Option<String> = row.try_get("last_sync_at")?;
    let next_refresh_at: String = row.try_get("next_refresh_at")?;
    Ok(IcsSubscription {
        id: row.try_get("id")?,
        url: row.try_get("url")?,
        name: row.try_get("name")?,
        color: row.try_get("color")?,
        calendar_id: row.try_get("calendar_id")?,
        enabled: row.try_get("enabled")?,
        etag: row.try_get("etag")?,
        last_modified: row.try_get("last_modified")?,
        last_sync_at: last_sync_at.map(|v| parse_dt(&v)),
        next_refresh_at: parse_dt(&next_refresh_at),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::model::{Account, AccountProvider, Calendar, Event};

    async fn test_store() -> Store {
        Store::new_in_memory().await.expect("in-memory store")
    }

    #[tokio::test]
    async fn round_trips_event_through_sqlite() {
        let store = test_store().await;
        let account = Account::new(AccountProvider::CalDav, "a@example.com".into(), "A".into());
        store.upsert_account(&account).await.unwrap();
        let calendar = Calendar::new(account.id.clone(), "https://dav/cal/".into(), "Home".into());
        store.upsert_calendar(&calendar).await.unwrap();

        let mut event = Event::new(calendar.id.clone(), "Standup".into(), 1000, 2000);
        event.categories = vec!["work".into()];
        store.upsert_event(&event).await.unwrap();

        let fetched = store.get_event(&event.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "Standup");
        assert_eq!(fetched.categories, vec!["work".to_string()]);
    }

    #[tokio::test]
    async fn broadcasts_change_on_upsert() {
        let store = test_store().await;
        let mut rx = store.subscribe();
        let account = Account::new(AccountProvider::Local, "b@example.com".into(), "B".into());
        store.upsert_account(&account).await.unwrap();
        let calendar = Calendar::local("Personal".into());
        store.upsert_calendar(&calendar).await.unwrap();
        let event = Event::new(calendar.id.clone(), "Lunch".into(), 1000, 2000);
        store.upsert_event(&event).await.unwrap();

        let mut saw_event_change = false;
        while let Ok(change) = rx.try_recv() {
            if let StoreChange::EventUpserted { event_id, .. } = change {
                if event_id == event.id {
                    saw_event_change = true;
                }
            }
        }
        assert!(saw_event_change);
    }

    #[tokio::test]
    async fn conflict_operations_are_scoped_to_target_calendar() {
        let store = test_store().await;
        let account = Account::new(AccountProvider::CalDav, "c@example.com".into(), "C".into());
        store.upsert_account(&account).await.unwrap();
        let cal_a = Calendar::new(account.id.clone(), "https://dav/a/".into(), "A".into());
        let cal_b = Calendar::new(account.id.clone(), "https://dav/b/".into(), "B".into());
        store.upsert_calendar(&cal_a).await.unwrap();
        store.upsert_calendar(&cal_b).await.unwrap();

        let event_a = Event::new(cal_a.id.clone(), "In A".into(), 0, 1);
        store.upsert_event(&event_a).await.unwrap();

        let op = PendingOperation {
            id: uuid::Uuid::new_v4().to_string(),
            event_id: event_a.id.clone(),
            kind: PendingOperationKind::Update,
            status: PendingOperationStatus::Conflict,
            retry_count: 0,
            max_retries: 10,
            next_retry_at: None,
            target_url: None,
            target_calendar_id: None,
            source_calendar_id: None,
            move_phase: None,
            lifetime_reset_at: Utc::now(),
            failed_at: None,
            created_at: Utc::now(),
        };
        store.enqueue_operation(&op).await.unwrap();

        let conflicts_a = store.get_conflict_operations(&cal_a.id).await.unwrap();
        let conflicts_b = store.get_conflict_operations(&cal_b.id).await.unwrap();
        assert_eq!(conflicts_a.len(), 1);
        assert!(conflicts_b.is_empty());
    }

    #[tokio::test]
    async fn occurrences_with_events_prefers_the_exception_events_row() {
        let store = test_store().await;
        let account = Account::new(AccountProvider::Local, "d@example.com".into(), "D".into());
        store.upsert_account(&account).await.unwrap();
        let calendar = Calendar::local("Work".into());
        store.upsert_calendar(&calendar).await.unwrap();

        let series = Event::new(calendar.id.clone(), "Standup".into(), 1_000, 2_000);
        store.upsert_event(&series).await.unwrap();
        let exception = Event::new(calendar.id.clone(), "Standup (moved)".into(), 5_000, 6_000);
        store.upsert_event(&exception).await.unwrap();

        let plain = Occurrence {
            id: uuid::Uuid::new_v4().to_string(),
            event_id: series.id.clone(),
            calendar_id: calendar.id.clone(),
            start_ts: 1_000,
            end_ts: 2_000,
            start_day: 0,
            end_day: 0,
            is_cancelled: false,
            exception_event_id: None,
        };
        let overridden = Occurrence {
            id: uuid::Uuid::new_v4().to_string(),
            event_id: series.id.clone(),
            calendar_id: calendar.id.clone(),
            start_ts: 86_400 + 1_000,
            end_ts: 86_400 + 2_000,
            start_day: 1,
            end_day: 1,
            is_cancelled: false,
            exception_event_id: Some(exception.id.clone()),
        };
        store.upsert_occurrence(&plain).await.unwrap();
        store.upsert_occurrence(&overridden).await.unwrap();

        let results = store.get_occurrences_with_events_in_range(&calendar.id, 0, 1).await.unwrap();
        assert_eq!(results.len(), 2);
        let plain_result = results.iter().find(|r| r.occurrence.id == plain.id).unwrap();
        assert_eq!(plain_result.event.id, series.id);
        let overridden_result = results.iter().find(|r| r.occurrence.id == overridden.id).unwrap();
        assert_eq!(overridden_result.event.id, exception.id);
        assert_eq!(overridden_result.event.title, "Standup (moved)");
    }
}
