//! `ConflictResolver`: decides how to reconcile a local pending mutation
//! against a server-side ETag mismatch (412) per the configured
//! `ConflictPolicy`.

use crate::calendar::model::{Event, SyncStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    ServerWins,
    ClientWins,
    LastWriteWins,
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        ConflictPolicy::ServerWins
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionResult {
    /// Take the server's copy; the local pending operation is dropped.
    Resolved,
    /// Keep the local copy and retry the push with the server's fresh ETag.
    Retried,
    /// Neither side wins outright (e.g. `LastWriteWins` with no usable
    /// server timestamp); the event is flagged `CONFLICT` for manual review.
    Failed,
}

pub struct ConflictResolver {
    policy: ConflictPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    /// `local` is the in-flight event as pushed; `server_modified_at` comes
    /// from the freshly-fetched server copy's `DTSTAMP`/`LAST-MODIFIED`.
    pub fn resolve(&self, local: &Event, server_modified_at: Option<DateTime<Utc>>) -> ResolutionResult {
        match self.policy {
            ConflictPolicy::ServerWins => ResolutionResult::Resolved,
            ConflictPolicy::ClientWins => ResolutionResult::Retried,
            ConflictPolicy::LastWriteWins => match server_modified_at {
                Some(server_ts) if server_ts > local.local_modified_at => ResolutionResult::Resolved,
                Some(_) => ResolutionResult::Retried,
                None => ResolutionResult::Failed,
            },
        }
    }

    /// Applies a `Resolved` verdict: stamp the event as synced against the
    /// server's copy and clear any pending mutation flag.
    pub fn apply_server_wins(&self, event: &mut Event, server_etag: Option<String>) {
        event.sync_status = SyncStatus::Synced;
        event.etag = server_etag;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::model::Event;
    use chrono::Duration;

    fn sample_event() -> Event {
        Event::new("cal-1".to_string(), "Title".to_string(), 0, 1)
    }

    #[test]
    fn server_wins_policy_always_resolves_to_server() {
        let resolver = ConflictResolver::new(ConflictPolicy::ServerWins);
        let event = sample_event();
        assert_eq!(resolver.resolve(&event, Some(Utc::now())), ResolutionResult::Resolved);
    }

    #[test]
    fn client_wins_policy_always_retries() {
        let resolver = ConflictResolver::new(ConflictPolicy::ClientWins);
        let event = sample_event();
        assert_eq!(resolver.resolve(&event, Some(Utc::now())), ResolutionResult::Retried);
    }

    #[test]
    fn last_write_wins_picks_newer_timestamp() {
        let resolver = ConflictResolver::new(ConflictPolicy::LastWriteWins);
        let mut event = sample_event();
        event.local_modified_at = Utc::now();

        let older_server = event.local_modified_at - Duration::minutes(5);
        assert_eq!(resolver.resolve(&event, Some(older_server)), ResolutionResult::Retried);

        let newer_server = event.local_modified_at + Duration::minutes(5);
        assert_eq!(resolver.resolve(&event, Some(newer_server)), ResolutionResult::Resolved);
    }

    #[test]
    fn last_write_wins_without_server_timestamp_fails_to_manual_review() {
        let resolver = ConflictResolver::new(ConflictPolicy::LastWriteWins);
        let event = sample_event();
        assert_eq!(resolver.resolve(&event, None), ResolutionResult::Failed);
    }
}
