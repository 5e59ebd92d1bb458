//! End-to-end coverage for `spec.md` §8's scenarios A-F, driven against
//! `FakeCalDavClient` (an in-memory `CalDavTransport`) and a real in-memory
//! `Store` so each test exercises the full push/pull/conflict/materializer
//! pipeline rather than a single module in isolation.

use caldav_sync_core::calendar::{
    Account, AccountProvider, Calendar, CalcardCodec, ConflictPolicy, Event, FakeCalDavClient,
    IcalCodec, OccurrenceMaterializer, PendingOperationStatus, PendingQueue, PullStrategy,
    PushStrategy, Store, SyncEngine, SyncStatus, CalendarNotification, CalendarNotificationManager,
    MAX_CONFLICT_SYNC_CYCLES,
};
use chrono::{Duration, Utc};
use std::sync::Arc;

async fn seed_account_and_calendar(store: &Store, remote_url: &str) -> (Account, Calendar) {
    let account = Account::new(AccountProvider::CalDav, "a@example.com".into(), "Work".into());
    store.upsert_account(&account).await.unwrap();
    let calendar = Calendar::new(account.id.clone(), remote_url.to_string(), "Work".into());
    store.upsert_calendar(&calendar).await.unwrap();
    (account, calendar)
}

/// Scenario A: a locally-created event is enqueued and pushed, coming back
/// `Synced` with a server-assigned etag and URL, the pending op gone.
#[tokio::test]
async fn scenario_a_create_and_push() {
    let store = Store::new_in_memory().await.unwrap();
    let (_account, calendar) = seed_account_and_calendar(&store, "https://dav/cal").await;

    let now = Utc::now().timestamp();
    let event = Event::new(calendar.id.clone(), "Standup".into(), now, now + 1800);
    assert_eq!(event.sync_status, SyncStatus::PendingCreate);
    store.upsert_event(&event).await.unwrap();

    let queue = PendingQueue::new(&store);
    queue.enqueue_create(event.id.clone(), calendar.id.clone()).await.unwrap();

    let fake = FakeCalDavClient::new();
    let push = PushStrategy::new(&fake, &store);
    let report = push.push_calendar(&calendar.id, &calendar.remote_url, 10).await.unwrap();

    assert_eq!(report.created, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.conflicts, 0);

    let stored = store.get_event(&event.id).await.unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Synced);
    assert!(stored.caldav_url.is_some());
    assert!(stored.etag.is_some());

    assert!(store.get_operations_for_calendar(&calendar.id).await.unwrap().is_empty());
}

/// Scenario B: a CONFLICT-status operation resolved under `ServerWins`
/// clears on the next cycle - the event adopts the server's copy and the
/// operation row disappears.
#[tokio::test]
async fn scenario_b_conflict_resolves_under_server_wins() {
    let store = Arc::new(Store::new_in_memory().await.unwrap());
    let (_account, calendar) = seed_account_and_calendar(&store, "https://dav/cal").await;

    let codec = CalcardCodec::new();
    let url = "https://dav/cal/e1.ics".to_string();
    let now = Utc::now().timestamp();

    let mut event = Event::new(calendar.id.clone(), "Team Sync".into(), now, now + 3600);
    event.sync_status = SyncStatus::Conflict;
    event.caldav_url = Some(url.clone());
    event.etag = Some("stale-local-etag".into());
    store.upsert_event(&event).await.unwrap();

    // The server's canonical body for the same UID - what a real conflict
    // fetch would return.
    let server_ical = codec.generate(&event);

    let fake = FakeCalDavClient::new();
    let server_etag = fake.seed(&url, &server_ical);

    let queue = PendingQueue::new(&store);
    let mut op = queue.enqueue_update(event.id.clone()).await.unwrap();
    queue.mark_conflict(&mut op).await.unwrap();
    assert_eq!(op.retry_count, 1);

    let notifications = Arc::new(CalendarNotificationManager::new());
    let engine = SyncEngine::new(store.clone(), notifications);

    let session = engine
        .sync_calendar(&fake, &calendar, ConflictPolicy::ServerWins, "test")
        .await
        .unwrap();
    assert_eq!(session.conflicts_resolved, 1);

    assert!(store.get_operation(&op.id).await.unwrap().is_none());
    let resolved = store.get_event(&event.id).await.unwrap().unwrap();
    assert_eq!(resolved.sync_status, SyncStatus::Synced);
    assert_eq!(resolved.etag.as_deref(), Some(server_etag.as_str()));
}

/// A `ClientWins` retry must pick up the server's fresh etag before the
/// operation goes back to `Pending`, or the re-queued push repeats the same
/// stale `If-Match` that produced the 412 and conflicts again forever.
#[tokio::test]
async fn conflict_retry_under_client_wins_adopts_the_servers_fresh_etag() {
    let store = Arc::new(Store::new_in_memory().await.unwrap());
    let (_account, calendar) = seed_account_and_calendar(&store, "https://dav/cal").await;

    let codec = CalcardCodec::new();
    let url = "https://dav/cal/e1.ics".to_string();
    let now = Utc::now().timestamp();

    let mut event = Event::new(calendar.id.clone(), "Team Sync".into(), now, now + 3600);
    event.sync_status = SyncStatus::Conflict;
    event.caldav_url = Some(url.clone());
    event.etag = Some("stale-local-etag".into());
    store.upsert_event(&event).await.unwrap();

    let server_ical = codec.generate(&event);
    let fake = FakeCalDavClient::new();
    let server_etag = fake.seed(&url, &server_ical);

    let queue = PendingQueue::new(&store);
    let mut op = queue.enqueue_update(event.id.clone()).await.unwrap();
    queue.mark_conflict(&mut op).await.unwrap();

    let notifications = Arc::new(CalendarNotificationManager::new());
    let engine = SyncEngine::new(store.clone(), notifications);

    let session = engine
        .sync_calendar(&fake, &calendar, ConflictPolicy::ClientWins, "test")
        .await
        .unwrap();
    assert_eq!(session.conflicts_resolved, 1);

    // The event keeps its local content (ClientWins) but the server's etag,
    // and the operation is back to Pending rather than dropped.
    let retried = store.get_event(&event.id).await.unwrap().unwrap();
    assert_eq!(retried.etag.as_deref(), Some(server_etag.as_str()));
    let pending_op = store.get_operation(&op.id).await.unwrap().expect("op stays queued for retry");
    assert_eq!(pending_op.status, PendingOperationStatus::Pending);
}

/// Scenario C: an incremental `sync-collection` pull delivers a master plus
/// a single modified occurrence sharing its UID - the master updates, the
/// exception is inserted with `original_event_id` pointing back at it, and
/// the occurrence row is linked to the exception.
#[tokio::test]
async fn scenario_c_incremental_pull_with_exception() {
    let store = Store::new_in_memory().await.unwrap();
    let (_account, mut calendar) = seed_account_and_calendar(&store, "https://dav/cal").await;
    // Pretend a prior sync already left a token behind, so this pull takes
    // the `sync-collection` tier rather than falling through to full range.
    calendar.sync_token = Some("token-0".into());
    store.update_sync_tokens(&calendar.id, None, Some("token-0")).await.unwrap();

    let start = Utc::now() - Duration::days(7);
    let mut master = Event::new(calendar.id.clone(), "Standup".into(), start.timestamp(), start.timestamp() + 1800);
    master.rrule = Some("FREQ=WEEKLY;COUNT=5".to_string());
    store.upsert_event(&master).await.unwrap();

    let materializer = OccurrenceMaterializer::new(&store);
    materializer.regenerate(&master.id).await.unwrap();

    // The first occurrence (the series' own DTSTART) gets overridden.
    let original_instance_time = master.start_ts;
    let mut exception = Event::new(
        calendar.id.clone(),
        "Standup (moved)".into(),
        original_instance_time + 3600,
        original_instance_time + 5400,
    );
    exception.uid = master.uid.clone();
    exception.original_instance_time = Some(original_instance_time);

    let codec = CalcardCodec::new();
    let combined = codec.generate_with_exceptions(&master, std::slice::from_ref(&exception));

    let href = "https://dav/cal/standup.ics".to_string();
    let fake = FakeCalDavClient::new();
    fake.seed(&href, &combined);

    let pull = PullStrategy::new(&fake, &store);
    pull.pull_calendar(&calendar, false).await.unwrap();

    let updated_master = store.get_event(&master.id).await.unwrap().unwrap();
    assert_eq!(updated_master.sync_status, SyncStatus::Synced);
    assert_eq!(updated_master.caldav_url.as_deref(), Some(href.as_str()));

    let stored_exception = store
        .get_event_by_uid(&calendar.id, &master.uid, Some(original_instance_time))
        .await
        .unwrap()
        .expect("exception should have been inserted");
    assert_eq!(stored_exception.title, "Standup (moved)");
    assert_eq!(stored_exception.original_event_id.as_deref(), Some(updated_master.id.as_str()));

    let occurrences = store.get_occurrences_for_event(&master.id).await.unwrap();
    let linked = occurrences
        .iter()
        .find(|o| o.start_ts == original_instance_time)
        .expect("the overridden occurrence should still exist");
    assert_eq!(linked.exception_event_id.as_deref(), Some(stored_exception.id.as_str()));
}

/// Scenario D: a cross-calendar MOVE drains as DELETE-from-source then
/// CREATE-in-target through two `PushStrategy::push_calendar` passes, and
/// the event ends up `Synced` under the target calendar.
#[tokio::test]
async fn scenario_d_cross_calendar_move() {
    let store = Store::new_in_memory().await.unwrap();
    let account = Account::new(AccountProvider::CalDav, "a@example.com".into(), "Work".into());
    store.upsert_account(&account).await.unwrap();
    let source = Calendar::new(account.id.clone(), "https://dav/source".into(), "Source".into());
    let target = Calendar::new(account.id.clone(), "https://dav/target".into(), "Target".into());
    store.upsert_calendar(&source).await.unwrap();
    store.upsert_calendar(&target).await.unwrap();

    let now = Utc::now().timestamp();
    let mut event = Event::new(source.id.clone(), "Offsite".into(), now, now + 3600);
    event.sync_status = SyncStatus::Synced;
    event.caldav_url = Some("https://dav/source/offsite.ics".to_string());
    event.etag = Some("e0".into());
    store.upsert_event(&event).await.unwrap();

    let queue = PendingQueue::new(&store);
    queue.enqueue_move(event.id.clone(), source.id.clone(), target.id.clone()).await.unwrap();

    let fake = FakeCalDavClient::new();
    let push = PushStrategy::new(&fake, &store);

    // Phase 0: DELETE from source. The event flips to the target calendar
    // with PendingCreate status as soon as the delete succeeds.
    let source_report = push.push_calendar(&source.id, &source.remote_url, 10).await.unwrap();
    assert_eq!(source_report.deleted, 1);

    let midway = store.get_event(&event.id).await.unwrap().unwrap();
    assert_eq!(midway.calendar_id, target.id);
    assert_eq!(midway.sync_status, SyncStatus::PendingCreate);
    assert!(midway.caldav_url.is_none());

    // Phase 1: CREATE in target.
    let target_report = push.push_calendar(&target.id, &target.remote_url, 10).await.unwrap();
    assert_eq!(target_report.created, 1);

    let moved = store.get_event(&event.id).await.unwrap().unwrap();
    assert_eq!(moved.calendar_id, target.id);
    assert_eq!(moved.sync_status, SyncStatus::Synced);
    assert!(moved.caldav_url.as_deref().unwrap().starts_with("https://dav/target"));

    assert!(store.get_operations_for_calendar(&source.id).await.unwrap().is_empty());
    assert!(store.get_operations_for_calendar(&target.id).await.unwrap().is_empty());
}

/// Scenario F: a CONFLICT operation that has exhausted
/// `MAX_CONFLICT_SYNC_CYCLES` is abandoned outright rather than retried
/// again - the event goes back to `Synced`, the operation row is removed,
/// and a single `OperationsAbandoned` notification fires.
#[tokio::test]
async fn scenario_f_conflict_abandoned_after_max_cycles() {
    let store = Arc::new(Store::new_in_memory().await.unwrap());
    let (_account, calendar) = seed_account_and_calendar(&store, "https://dav/cal").await;

    let now = Utc::now().timestamp();
    let event = Event::new(calendar.id.clone(), "Stubborn".into(), now, now + 1800);
    store.upsert_event(&event).await.unwrap();

    let queue = PendingQueue::new(&store);
    let mut op = queue.enqueue_update(event.id.clone()).await.unwrap();
    for _ in 0..=MAX_CONFLICT_SYNC_CYCLES {
        queue.mark_conflict(&mut op).await.unwrap();
    }
    assert!(op.retry_count > MAX_CONFLICT_SYNC_CYCLES);

    let notifications = Arc::new(CalendarNotificationManager::new());
    notifications.start().await;
    let mut receiver = notifications.subscribe();

    let fake = FakeCalDavClient::new();
    let engine = SyncEngine::new(store.clone(), notifications);
    let session = engine
        .sync_calendar(&fake, &calendar, ConflictPolicy::ServerWins, "test")
        .await
        .unwrap();
    assert_eq!(session.conflicts_resolved, 0);

    assert!(store.get_operation(&op.id).await.unwrap().is_none());
    let abandoned_event = store.get_event(&event.id).await.unwrap().unwrap();
    assert_eq!(abandoned_event.sync_status, SyncStatus::Synced);

    let mut saw_abandonment = false;
    while let Ok(Ok(notification)) =
        tokio::time::timeout(std::time::Duration::from_secs(1), receiver.recv()).await
    {
        if let CalendarNotification::OperationsAbandoned { event_titles, .. } = notification {
            assert_eq!(event_titles, vec!["Stubborn".to_string()]);
            saw_abandonment = true;
            break;
        }
    }
    assert!(saw_abandonment, "expected an OperationsAbandoned notification");
}
