//! CalDAV synchronization core: data model, wire codecs, persistence, and
//! the push/pull sync engine that drives them. See `SPEC_FULL.md` for the
//! module layout this tree follows.

pub mod client;
pub mod conflict;
pub mod engine;
pub mod ical;
pub mod ics_subscription;
pub mod model;
pub mod notifications;
pub mod occurrence;
pub mod pull;
pub mod push;
pub mod queue;
pub mod quirks;
pub mod store;
pub mod test_support;

pub use client::{CalDavClient, CalDavError, CalDavResult, CalDavTransport, SyncDelta};
pub use conflict::{ConflictPolicy, ConflictResolver, ResolutionResult};
pub use engine::{SyncEngine, SyncEngineResult, SyncError, SyncResult};
pub use ical::{CalcardCodec, IcalCodec, IcalError, IcalResult, ParsedCalendar};
pub use ics_subscription::{FetchOutcome, IcsFetchError, IcsSubscriptionFetcher};
pub use model::{
    Account, AccountProvider, Calendar, Event, EventClassification, EventReminder, EventStatus,
    EventTransparency, IcsSubscription, MovePhase, Occurrence, PendingOperation,
    PendingOperationKind, PendingOperationStatus, ReminderAction, SyncLog, SyncSession,
    SyncSessionStatus, SyncStatus, SyncType, MAX_CONFLICT_SYNC_CYCLES, MAX_RETRIES,
};
pub use notifications::{CalendarNotification, CalendarNotificationManager};
pub use occurrence::{MaterializerError, MaterializerResult, OccurrenceMaterializer};
pub use pull::{PullError, PullOutcome, PullReport, PullResult, PullStrategy};
pub use push::{PushError, PushReport, PushStrategy};
pub use queue::{PendingQueue, QueueError, QueueResult, SweepOutcome};
pub use quirks::{
    ChangedItem, DefaultQuirks, IcalItem, ICloudQuirks, ParsedCalendarEntry, ProviderRegistry,
    Quirks, QuirksError, QuirksResult,
};
pub use store::{OccurrenceWithEvent, Store, StoreChange, StoreError, StoreResult};
pub use test_support::FakeCalDavClient;
