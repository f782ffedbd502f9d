//! Forwards server-pushed notifications to a [`NotificationSink`].

use std::sync::Arc;

use serde::Deserialize;
use sitelift_core::events::{HandlerId, RealtimeEvent, Topic};
use sitelift_core::models::Notification;
use sitelift_core::traits::NotificationSink;

use crate::realtime::{RealtimeConnection, Transport};

pub const NOTIFICATION: &str = "notification";
pub const EXTRACTION_COMPLETE: &str = "extraction_complete";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractionComplete {
    url: String,
    #[serde(default)]
    result_url: Option<String>,
}

/// Subscription handles for the two notification topics. Dropping the bridge
/// leaves the handlers registered; call [`detach`](Self::detach) to remove them.
pub struct NotificationBridge<T: Transport> {
    connection: RealtimeConnection<T>,
    handlers: Vec<(Topic, HandlerId)>,
}

impl<T: Transport> NotificationBridge<T> {
    pub fn attach<S: NotificationSink>(connection: &RealtimeConnection<T>, sink: S) -> Self {
        let sink = Arc::new(sink);

        let direct = sink.clone();
        let notification_topic = Topic::message(NOTIFICATION);
        let on_notification = connection.on(notification_topic.clone(), move |event| {
            if let Some(notification) = event_data(event).and_then(parse_notification) {
                direct.notify(notification);
            }
        });

        let complete_topic = Topic::message(EXTRACTION_COMPLETE);
        let on_complete = connection.on(complete_topic.clone(), move |event| {
            if let Some(notification) = event_data(event).and_then(parse_extraction_complete) {
                sink.notify(notification);
            }
        });

        Self {
            connection: connection.clone(),
            handlers: vec![
                (notification_topic, on_notification),
                (complete_topic, on_complete),
            ],
        }
    }

    pub fn detach(self) {
        for (topic, id) in &self.handlers {
            self.connection.off(topic, *id);
        }
    }
}

fn event_data(event: &RealtimeEvent) -> Option<&serde_json::Value> {
    match event {
        RealtimeEvent::Message(envelope) => Some(&envelope.data),
        _ => None,
    }
}

fn parse_notification(data: &serde_json::Value) -> Option<Notification> {
    match Notification::deserialize(data) {
        Ok(notification) => Some(notification),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed notification");
            None
        }
    }
}

fn parse_extraction_complete(data: &serde_json::Value) -> Option<Notification> {
    match ExtractionComplete::deserialize(data) {
        Ok(done) => Some(Notification {
            title: "Extraction Complete".to_string(),
            message: format!("Your extraction of {} is complete!", done.url),
            url: done.result_url,
        }),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed extraction_complete message");
            None
        }
    }
}
