//! `OccurrenceMaterializer`: expands `RRULE`/`RDATE`/`EXDATE` into the
//! indexed `occurrences` table and links expanded instances back to
//! modified-exception events.
//!
//! Grounded in the `rrule` crate usage in pack repo `kirilledition-televent`
//! (`crates/core/src/recurrence.rs`): DTSTART is prepended to the RRULE
//! string so the crate's strict parser has an anchor, and `after()` seeks
//! into the expansion window instead of iterating from the beginning.

use crate::calendar::model::{Event, Occurrence};
use crate::calendar::store::{Store, StoreError};
use chrono::{DateTime, Duration, Utc};
use rrule::{RRuleError, RRuleSet, Tz};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MaterializerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid recurrence rule: {0}")]
    InvalidRule(String),
}

pub type MaterializerResult<T> = Result<T, MaterializerError>;

/// Expansion window bound, per `spec.md` §4.10: `[now - 1y, now + 2y]`.
const WINDOW_PAST: Duration = Duration::days(365);
const WINDOW_FUTURE: Duration = Duration::days(365 * 2);

pub struct OccurrenceMaterializer<'a> {
    store: &'a Store,
}

impl<'a> OccurrenceMaterializer<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    fn day_number(ts: DateTime<Utc>) -> u32 {
        ts.format("%Y%m%d").to_string().parse().unwrap_or(0)
    }

    /// Delete existing occurrences for `event_id` and recompute them from
    /// scratch. A non-recurring event gets exactly one mirroring row; a
    /// recurring one is expanded within the window and EXDATE-matched
    /// instants are inserted cancelled rather than omitted, so a later
    /// `linkException` still has a row to attach to.
    pub async fn regenerate(&self, event_id: &str) -> MaterializerResult<usize> {
        let Some(event) = self.store.get_event(event_id).await? else {
            return Ok(0);
        };

        if !event.is_recurring() {
            let occ = Occurrence {
                id: Uuid::new_v4().to_string(),
                event_id: event.id.clone(),
                calendar_id: event.calendar_id.clone(),
                start_ts: event.start_ts,
                end_ts: event.end_ts,
                start_day: Self::day_number(DateTime::<Utc>::from_timestamp(event.start_ts, 0).unwrap_or_default()),
                end_day: Self::day_number(DateTime::<Utc>::from_timestamp(event.end_ts, 0).unwrap_or_default()),
                is_cancelled: false,
                exception_event_id: None,
            };
            self.store.replace_occurrences(&event.id, &[occ]).await?;
            return Ok(1);
        }

        let now = Utc::now();
        let window_start = now - WINDOW_PAST;
        let window_end = now + WINDOW_FUTURE;
        let duration = event.end_ts - event.start_ts;

        let mut starts = self.expand(&event, window_start, window_end)?;
        for rdate in &event.rdate {
            let ts = DateTime::<Utc>::from_timestamp(*rdate, 0).unwrap_or_default();
            if ts >= window_start && ts <= window_end && !starts.contains(&ts) {
                starts.push(ts);
            }
        }
        starts.sort();
        starts.dedup();

        let exdate_set: std::collections::HashSet<i64> = event.exdate.iter().copied().collect();

        let occurrences: Vec<Occurrence> = starts
            .into_iter()
            .map(|start| {
                let start_ts = start.timestamp();
                let end_ts = start_ts + duration;
                Occurrence {
                    id: Uuid::new_v4().to_string(),
                    event_id: event.id.clone(),
                    calendar_id: event.calendar_id.clone(),
                    start_ts,
                    end_ts,
                    start_day: Self::day_number(start),
                    end_day: Self::day_number(DateTime::<Utc>::from_timestamp(end_ts, 0).unwrap_or_default()),
                    is_cancelled: exdate_set.contains(&start_ts),
                    exception_event_id: None,
                }
            })
            .collect();

        let count = occurrences.len();
        self.store.replace_occurrences(&event.id, &occurrences).await?;
        Ok(count)
    }

    fn expand(
        &self,
        event: &Event,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> MaterializerResult<Vec<DateTime<Utc>>> {
        let Some(rrule_str) = &event.rrule else {
            return Ok(Vec::new());
        };
        let dtstart = DateTime::<Utc>::from_timestamp(event.start_ts, 0).unwrap_or_default();
        let dtstart_str = dtstart.format("%Y%m%dT%H%M%SZ").to_string();
        let full = format!("DTSTART:{dtstart_str}\nRRULE:{rrule_str}");
        let rrule_set: RRuleSet = full
            .parse()
            .map_err(|e: RRuleError| MaterializerError::InvalidRule(e.to_string()))?;

        let rrule_tz = rrule_set.get_dt_start().timezone();
        let search_start = window_start
            .with_timezone(&rrule_tz)
            .checked_sub_signed(Duration::seconds(1))
            .unwrap_or_else(|| window_start.with_timezone(&rrule_tz));

        // A far-future COUNT=n cap would end the iteration itself; an
        // unbounded rule is clipped to this arbitrary-but-generous ceiling
        // so a bad "FREQ=SECONDLY" rule cannot blow up memory.
        let dates = rrule_set.after(search_start).all(10_000).dates;
        Ok(dates
            .into_iter()
            .map(|d: DateTime<Tz>| d.with_timezone(&Utc))
            .take_while(|d| *d <= window_end)
            .collect())
    }

    /// Binds an exception event to the occurrence it modifies. If the rule
    /// never actually emits that instant (e.g. it was excluded or the
    /// series has since changed), a synthetic occurrence is inserted so the
    /// link still exists.
    pub async fn link_exception(
        &self,
        master_id: &str,
        original_instance_time: i64,
        exception_event_id: &str,
    ) -> MaterializerResult<()> {
        let Some(master) = self.store.get_event(master_id).await? else {
            return Ok(());
        };
        let occurrences = self.store.get_occurrences_for_event(master_id).await?;
        let existing = occurrences
            .into_iter()
            .find(|o| o.event_id == master_id && o.start_ts == original_instance_time);

        let Some(exception) = self.store.get_event(exception_event_id).await? else {
            return Ok(());
        };

        let occ = if let Some(mut found) = existing {
            found.exception_event_id = Some(exception_event_id.to_string());
            found
        } else {
            let start = DateTime::<Utc>::from_timestamp(exception.start_ts, 0).unwrap_or_default();
            let end = DateTime::<Utc>::from_timestamp(exception.end_ts, 0).unwrap_or_default();
            Occurrence {
                id: Uuid::new_v4().to_string(),
                event_id: master_id.to_string(),
                calendar_id: master.calendar_id.clone(),
                start_ts: exception.start_ts,
                end_ts: exception.end_ts,
                start_day: Self::day_number(start),
                end_day: Self::day_number(end),
                is_cancelled: false,
                exception_event_id: Some(exception_event_id.to_string()),
            }
        };
        self.store.upsert_occurrence(&occ).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::model::{Account, AccountProvider, Calendar};
    use chrono::TimeZone;

    async fn setup() -> (Store, Calendar) {
        let store = Store::new_in_memory().await.unwrap();
        let account = Account::new(AccountProvider::CalDav, "a@example.com".into(), "A".into());
        store.upsert_account(&account).await.unwrap();
        let calendar = Calendar::new(account.id.clone(), "https://dav/a/".into(), "A".into());
        store.upsert_calendar(&calendar).await.unwrap();
        (store, calendar)
    }

    #[tokio::test]
    async fn non_recurring_event_gets_single_mirrored_occurrence() {
        let (store, calendar) = setup().await;
        let event = Event::new(calendar.id.clone(), "Once".into(), 1_700_000_000, 1_700_003_600);
        store.upsert_event(&event).await.unwrap();

        let materializer = OccurrenceMaterializer::new(&store);
        let count = materializer.regenerate(&event.id).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn weekly_rrule_expands_within_window_and_respects_exdate() {
        let (store, calendar) = setup().await;
        let start = Utc::now() - Duration::days(7);
        let mut event = Event::new(calendar.id.clone(), "Weekly".into(), start.timestamp(), start.timestamp() + 3600);
        event.rrule = Some("FREQ=WEEKLY;COUNT=6".to_string());
        let second = start + Duration::weeks(1);
        event.exdate.push(second.timestamp());
        store.upsert_event(&event).await.unwrap();

        let materializer = OccurrenceMaterializer::new(&store);
        let count = materializer.regenerate(&event.id).await.unwrap();
        assert!(count >= 5);

        let occurrences = store.get_occurrences_for_event(&event.id).await.unwrap();
        let cancelled = occurrences.iter().filter(|o| o.is_cancelled).count();
        assert_eq!(cancelled, 1);

        // uniqueness: no duplicate (event_id, start_ts) pairs.
        let mut seen = std::collections::HashSet::new();
        for o in &occurrences {
            assert!(seen.insert((o.event_id.clone(), o.start_ts)));
        }
    }

    #[tokio::test]
    async fn link_exception_binds_occurrence_to_exception_event() {
        let (store, calendar) = setup().await;
        let start = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let mut master = Event::new(calendar.id.clone(), "Standup".into(), start.timestamp(), start.timestamp() + 1800);
        master.rrule = Some("FREQ=WEEKLY;COUNT=10".to_string());
        store.upsert_event(&master).await.unwrap();

        let materializer = OccurrenceMaterializer::new(&store);
        materializer.regenerate(&master.id).await.unwrap();

        let original_instant = start + Duration::weeks(3);
        let mut exception = Event::new(calendar.id.clone(), "Standup (moved)".into(), original_instant.timestamp() + 3600, original_instant.timestamp() + 5400);
        exception.uid = master.uid.clone();
        exception.original_event_id = Some(master.id.clone());
        exception.original_instance_time = Some(original_instant.timestamp());
        store.upsert_event(&exception).await.unwrap();

        materializer
            .link_exception(&master.id, original_instant.timestamp(), &exception.id)
            .await
            .unwrap();

        let occurrences = store.get_occurrences_for_event(&master.id).await.unwrap();
        let linked = occurrences
            .iter()
            .find(|o| o.start_ts == original_instant.timestamp())
            .unwrap();
        assert_eq!(linked.exception_event_id.as_deref(), Some(exception.id.as_str()));
    }
}
