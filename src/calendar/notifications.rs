//! Change-signal fan-out: the sync core only emits "something changed"
//! notifications (reminder scheduling and display are a host concern, per
//! `spec.md` §1). Kept from the teacher's `CalendarNotificationManager` shape
//! — an mpsc intake funneled into a broadcast fan-out — generalized to the
//! abandonment and parse-error surfaces `PendingQueue`/`PullStrategy` need.

use crate::calendar::model::Event;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone)]
pub enum CalendarNotification {
    EventCreated { calendar_id: String, event: Event },
    EventUpdated { calendar_id: String, event: Event },
    EventDeleted { calendar_id: String, event_id: String },
    SyncStarted { calendar_id: String },
    SyncCompleted { calendar_id: String, new_count: u32, updated_count: u32 },
    SyncFailed { calendar_id: String, error: String },
    /// One or more pending operations were abandoned this cycle (30-day
    /// lifetime or 3 conflict cycles exhausted), per `spec.md` §4.5/§8
    /// Scenario F. Fired at most once per `SyncEngine::sync_calendar` call.
    OperationsAbandoned { calendar_id: String, event_titles: Vec<String> },
    /// A UID has failed to parse on 3 consecutive pull cycles (`spec.md`
    /// §4.7's `abandonedParseErrors`).
    ParseErrorAbandoned { calendar_id: String, uid: String },
}

impl CalendarNotification {
    pub fn calendar_id(&self) -> &str {
        match self {
            CalendarNotification::EventCreated { calendar_id, .. }
            | CalendarNotification::EventUpdated { calendar_id, .. }
            | CalendarNotification::EventDeleted { calendar_id, .. }
            | CalendarNotification::SyncStarted { calendar_id, .. }
            | CalendarNotification::SyncCompleted { calendar_id, .. }
            | CalendarNotification::SyncFailed { calendar_id, .. }
            | CalendarNotification::OperationsAbandoned { calendar_id, .. }
            | CalendarNotification::ParseErrorAbandoned { calendar_id, .. } => calendar_id,
        }
    }
}

pub struct CalendarNotificationManager {
    sender: broadcast::Sender<CalendarNotification>,
    notification_receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<CalendarNotification>>>,
    notification_sender: mpsc::UnboundedSender<CalendarNotification>,
}

impl Default for CalendarNotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CalendarNotificationManager {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1000);
        let (notification_sender, notification_receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            notification_receiver: Arc::new(tokio::sync::Mutex::new(notification_receiver)),
            notification_sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CalendarNotification> {
        self.sender.subscribe()
    }

    pub fn get_sender(&self) -> mpsc::UnboundedSender<CalendarNotification> {
        self.notification_sender.clone()
    }

    pub async fn start(&self) {
        let receiver = self.notification_receiver.clone();
        let sender = self.sender.clone();

        tokio::spawn(async move {
            let mut receiver = receiver.lock().await;
            while let Some(notification) = receiver.recv().await {
                if let Err(e) = sender.send(notification.clone()) {
                    tracing::warn!("failed to broadcast calendar notification: {}", e);
                }
                tracing::debug!("processed calendar notification: {:?}", notification);
            }
        });
    }

    fn publish(&self, notification: CalendarNotification) {
        if let Err(e) = self.notification_sender.send(notification) {
            tracing::error!("failed to enqueue calendar notification: {}", e);
        }
    }

    pub fn notify_event_created(&self, calendar_id: String, event: Event) {
        self.publish(CalendarNotification::EventCreated { calendar_id, event });
    }

    pub fn notify_event_updated(&self, calendar_id: String, event: Event) {
        self.publish(CalendarNotification::EventUpdated { calendar_id, event });
    }

    pub fn notify_event_deleted(&self, calendar_id: String, event_id: String) {
        self.publish(CalendarNotification::EventDeleted { calendar_id, event_id });
    }

    pub fn notify_sync_started(&self, calendar_id: String) {
        self.publish(CalendarNotification::SyncStarted { calendar_id });
    }

    pub fn notify_sync_completed(&self, calendar_id: String, new_count: u32, updated_count: u32) {
        self.publish(CalendarNotification::SyncCompleted { calendar_id, new_count, updated_count });
    }

    pub fn notify_sync_failed(&self, calendar_id: String, error: String) {
        self.publish(CalendarNotification::SyncFailed { calendar_id, error });
    }

    pub fn notify_operations_abandoned(&self, calendar_id: String, event_titles: Vec<String>) {
        if event_titles.is_empty() {
            return;
        }
        self.publish(CalendarNotification::OperationsAbandoned { calendar_id, event_titles });
    }

    pub fn notify_parse_error_abandoned(&self, calendar_id: String, uid: String) {
        self.publish(CalendarNotification::ParseErrorAbandoned { calendar_id, uid });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_broadcast_notification() {
        let manager = CalendarNotificationManager::new();
        manager.start().await;
        let mut receiver = manager.subscribe();

        let event = Event::new("cal-1".to_string(), "Standup".to_string(), 0, 3600);
        manager.notify_event_created("cal-1".to_string(), event.clone());

        match receiver.recv().await.unwrap() {
            CalendarNotification::EventCreated { calendar_id, event: received } => {
                assert_eq!(calendar_id, "cal-1");
                assert_eq!(received.id, event.id);
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    #[tokio::test]
    async fn abandonment_with_no_titles_is_not_published() {
        let manager = CalendarNotificationManager::new();
        manager.start().await;
        let mut receiver = manager.subscribe();

        manager.notify_operations_abandoned("cal-1".to_string(), Vec::new());
        manager.notify_sync_started("cal-1".to_string());

        match receiver.recv().await.unwrap() {
            CalendarNotification::SyncStarted { .. } => {}
            other => panic!("expected the abandonment with no titles to be skipped, got {other:?}"),
        }
    }
}
