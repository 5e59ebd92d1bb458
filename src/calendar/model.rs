//! Persistent data model for the CalDAV synchronization core: accounts,
//! calendars, events, materialized occurrences, the pending-operation queue,
//! and the append-only session/log records used for diagnostics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Where an account's calendars come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountProvider {
    Local,
    ICloud,
    CalDav,
    Ics,
    Contacts,
}

impl AccountProvider {
    /// `LOCAL`, `ICS`, and `CONTACTS` accounts never run the CalDAV sync
    /// pipeline; only `ICLOUD`/`CALDAV` accounts are admitted to `SyncEngine`.
    pub fn syncs_via_caldav(&self) -> bool {
        matches!(self, AccountProvider::ICloud | AccountProvider::CalDav)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountProvider::Local => "LOCAL",
            AccountProvider::ICloud => "ICLOUD",
            AccountProvider::CalDav => "CALDAV",
            AccountProvider::Ics => "ICS",
            AccountProvider::Contacts => "CONTACTS",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "LOCAL" => Some(AccountProvider::Local),
            "ICLOUD" => Some(AccountProvider::ICloud),
            "CALDAV" => Some(AccountProvider::CalDav),
            "ICS" => Some(AccountProvider::Ics),
            "CONTACTS" => Some(AccountProvider::Contacts),
            _ => None,
        }
    }
}

/// A configured calendar account. Unique on `(provider, email)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub provider: AccountProvider,
    pub email: String,
    pub display_name: String,
    pub principal_url: Option<String>,
    pub home_set_url: Option<String>,
    pub is_enabled: bool,
}

impl Account {
    pub fn new(provider: AccountProvider, email: String, display_name: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            provider,
            email,
            display_name,
            principal_url: None,
            home_set_url: None,
            is_enabled: true,
        }
    }
}

/// A single calendar collection belonging to an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Calendar {
    pub id: String,
    pub account_id: String,
    pub remote_url: String,
    pub display_name: String,
    pub color: Option<String>,
    pub is_read_only: bool,
    pub is_visible: bool,
    pub is_default: bool,
    pub ctag: Option<String>,
    pub sync_token: Option<String>,
}

impl Calendar {
    pub fn new(account_id: String, remote_url: String, display_name: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            account_id,
            remote_url,
            display_name,
            color: None,
            is_read_only: false,
            is_visible: true,
            is_default: false,
            ctag: None,
            sync_token: None,
        }
    }

    pub fn local(display_name: String) -> Self {
        let mut cal = Self::new(
            "local".to_string(),
            format!("local://{}", Uuid::new_v4()),
            display_name,
        );
        cal.is_default = true;
        cal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Tentative,
    Confirmed,
    Cancelled,
}

impl EventStatus {
    pub fn to_icalendar(&self) -> &'static str {
        match self {
            EventStatus::Tentative => "TENTATIVE",
            EventStatus::Confirmed => "CONFIRMED",
            EventStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn from_icalendar(value: &str) -> Self {
        match value.to_uppercase().as_str() {
            "TENTATIVE" => EventStatus::Tentative,
            "CANCELLED" => EventStatus::Cancelled,
            _ => EventStatus::Confirmed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTransparency {
    Opaque,
    Transparent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventClassification {
    Public,
    Private,
    Confidential,
}

/// Mirrors `spec.md` §3's writable-event lifecycle. Transitions only happen
/// through `PendingQueue`, `ConflictResolver`, or the push success path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Synced,
    PendingCreate,
    PendingUpdate,
    PendingDelete,
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "SYNCED",
            SyncStatus::PendingCreate => "PENDING_CREATE",
            SyncStatus::PendingUpdate => "PENDING_UPDATE",
            SyncStatus::PendingDelete => "PENDING_DELETE",
            SyncStatus::Conflict => "CONFLICT",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "PENDING_CREATE" => SyncStatus::PendingCreate,
            "PENDING_UPDATE" => SyncStatus::PendingUpdate,
            "PENDING_DELETE" => SyncStatus::PendingDelete,
            "CONFLICT" => SyncStatus::Conflict,
            _ => SyncStatus::Synced,
        }
    }
}

/// A calendar event, master or exception. `uid` is shared by a master and
/// all of its exceptions; the unique key is `(calendar_id, uid,
/// original_instance_time)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub uid: String,
    pub calendar_id: String,
    pub import_id: Option<String>,

    pub title: String,
    pub location: Option<String>,
    pub description: Option<String>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub timezone: Option<String>,
    pub is_all_day: bool,
    pub status: EventStatus,
    pub transp: EventTransparency,
    pub classification: EventClassification,
    pub priority: Option<u8>,
    pub geo_lat: Option<f64>,
    pub geo_lon: Option<f64>,
    pub color: Option<String>,
    pub url: Option<String>,
    pub categories: Vec<String>,

    pub rrule: Option<String>,
    pub rdate: Vec<i64>,
    pub exdate: Vec<i64>,
    pub duration: Option<i64>,

    pub original_event_id: Option<String>,
    pub original_instance_time: Option<i64>,

    pub caldav_url: Option<String>,
    pub etag: Option<String>,
    pub sequence: u32,
    pub sync_status: SyncStatus,
    pub dtstamp: DateTime<Utc>,
    pub local_modified_at: DateTime<Utc>,
    pub server_modified_at: Option<DateTime<Utc>>,
    pub raw_ical: Option<String>,
    pub alarm_count: u32,
    pub reminders: Vec<EventReminder>,
    /// Unknown `X-*` properties and parameter-qualified variants preserved
    /// byte-exact for round-trip fidelity, keyed by `"PROPNAME;PARAMS"`.
    pub unknown_properties: HashMap<String, String>,
}

impl Event {
    pub fn new(calendar_id: String, title: String, start_ts: i64, end_ts: i64) -> Self {
        let now = Utc::now();
        let uid = Uuid::new_v4().to_string();
        Self {
            id: uid.clone(),
            uid,
            calendar_id,
            import_id: None,
            title,
            location: None,
            description: None,
            start_ts,
            end_ts,
            timezone: None,
            is_all_day: false,
            status: EventStatus::Confirmed,
            transp: EventTransparency::Opaque,
            classification: EventClassification::Public,
            priority: None,
            geo_lat: None,
            geo_lon: None,
            color: None,
            url: None,
            categories: Vec::new(),
            rrule: None,
            rdate: Vec::new(),
            exdate: Vec::new(),
            duration: None,
            original_event_id: None,
            original_instance_time: None,
            caldav_url: None,
            etag: None,
            sequence: 0,
            sync_status: SyncStatus::PendingCreate,
            dtstamp: now,
            local_modified_at: now,
            server_modified_at: None,
            raw_ical: None,
            alarm_count: 0,
            reminders: Vec::new(),
            unknown_properties: HashMap::new(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.rrule.is_some() || !self.rdate.is_empty()
    }

    pub fn is_exception(&self) -> bool {
        self.original_event_id.is_some()
    }

    pub fn touch(&mut self) {
        self.local_modified_at = Utc::now();
        self.sequence += 1;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventReminder {
    /// Minutes before start; negative values are before, zero is at-start.
    pub trigger_minutes: i32,
    pub action: ReminderAction,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReminderAction {
    Display,
    Email,
    Audio,
}

impl ReminderAction {
    pub fn to_icalendar(&self) -> &'static str {
        match self {
            ReminderAction::Display => "DISPLAY",
            ReminderAction::Email => "EMAIL",
            ReminderAction::Audio => "AUDIO",
        }
    }

    pub fn from_icalendar(value: &str) -> Self {
        match value.to_uppercase().as_str() {
            "EMAIL" => ReminderAction::Email,
            "AUDIO" => ReminderAction::Audio,
            _ => ReminderAction::Display,
        }
    }
}

/// A materialized instance of a (possibly recurring) event, within the
/// expansion window owned by `OccurrenceMaterializer`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: String,
    pub event_id: String,
    pub calendar_id: String,
    pub start_ts: i64,
    pub end_ts: i64,
    pub start_day: u32,
    pub end_day: u32,
    pub is_cancelled: bool,
    pub exception_event_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingOperationKind {
    Create,
    Update,
    Delete,
    Move,
}

impl PendingOperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingOperationKind::Create => "CREATE",
            PendingOperationKind::Update => "UPDATE",
            PendingOperationKind::Delete => "DELETE",
            PendingOperationKind::Move => "MOVE",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "UPDATE" => PendingOperationKind::Update,
            "DELETE" => PendingOperationKind::Delete,
            "MOVE" => PendingOperationKind::Move,
            _ => PendingOperationKind::Create,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingOperationStatus {
    Pending,
    InProgress,
    Failed,
    Conflict,
}

impl PendingOperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingOperationStatus::Pending => "PENDING",
            PendingOperationStatus::InProgress => "IN_PROGRESS",
            PendingOperationStatus::Failed => "FAILED",
            PendingOperationStatus::Conflict => "CONFLICT",
        }
    }

    pub fn from_str(value: &str) -> Self {
        match value {
            "IN_PROGRESS" => PendingOperationStatus::InProgress,
            "FAILED" => PendingOperationStatus::Failed,
            "CONFLICT" => PendingOperationStatus::Conflict,
            _ => PendingOperationStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovePhase {
    DeleteFromSource = 0,
    CreateInTarget = 1,
}

/// A queued mutation awaiting push. Exclusively owned by `PendingQueue`;
/// deleted on success or abandonment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: String,
    pub event_id: String,
    pub kind: PendingOperationKind,
    pub status: PendingOperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub target_url: Option<String>,
    pub target_calendar_id: Option<String>,
    pub source_calendar_id: Option<String>,
    pub move_phase: Option<MovePhase>,
    pub lifetime_reset_at: DateTime<Utc>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

pub const MAX_RETRIES: u32 = 10;
pub const MAX_CONFLICT_SYNC_CYCLES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncSessionStatus {
    Success,
    Partial,
    Failed,
    Cancelled,
}

/// Append-only diagnostic record, one per `SyncEngine::sync_calendar` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSession {
    pub id: String,
    pub calendar_id: String,
    pub calendar_name: String,
    pub sync_type: SyncType,
    pub trigger_source: String,
    pub start_time: DateTime<Utc>,
    pub duration_ms: i64,
    pub events_fetched: u32,
    pub events_written: u32,
    pub events_updated: u32,
    pub events_deleted: u32,
    pub events_pushed_created: u32,
    pub events_pushed_updated: u32,
    pub events_pushed_deleted: u32,
    pub conflicts_resolved: u32,
    pub skipped_parse_error: u32,
    pub abandoned_parse_errors: u32,
    pub error_type: Option<String>,
    pub error_stage: Option<String>,
    pub error_message: Option<String>,
    pub status: SyncSessionStatus,
}

impl SyncSession {
    pub fn start(calendar_id: String, calendar_name: String, sync_type: SyncType, trigger_source: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            calendar_id,
            calendar_name,
            sync_type,
            trigger_source,
            start_time: Utc::now(),
            duration_ms: 0,
            events_fetched: 0,
            events_written: 0,
            events_updated: 0,
            events_deleted: 0,
            events_pushed_created: 0,
            events_pushed_updated: 0,
            events_pushed_deleted: 0,
            conflicts_resolved: 0,
            skipped_parse_error: 0,
            abandoned_parse_errors: 0,
            error_type: None,
            error_stage: None,
            error_message: None,
            status: SyncSessionStatus::Success,
        }
    }
}

/// Append-only audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub calendar_id: Option<String>,
    pub event_uid: Option<String>,
    pub action: String,
    pub result: String,
    pub details: Option<String>,
    pub http_status: Option<u16>,
}

impl SyncLog {
    pub fn new(action: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            calendar_id: None,
            event_uid: None,
            action: action.into(),
            result: result.into(),
            details: None,
            http_status: None,
        }
    }
}

/// A read-only, pull-only passive ICS feed subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IcsSubscription {
    pub id: String,
    pub url: String,
    pub name: String,
    pub color: Option<String>,
    pub calendar_id: String,
    pub enabled: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_refresh_at: DateTime<Utc>,
}
