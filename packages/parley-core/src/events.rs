//! # Application Events
//!
//! Everything the session reports to the application goes through one
//! [`EventDispatcher`].
//!
//! ```text
//! ┌───────────────┐   AppEvent    ┌─────────────────┐
//! │    Session    │ ────────────► │ EventDispatcher │ ──► handler #1
//! │  (handle())   │               │  (by EventName) │ ──► handler #2
//! └───────────────┘               └─────────────────┘ ──► ...
//! ```
//!
//! Handlers run synchronously, in registration order, outside the
//! registry lock, so a handler may register or remove handlers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::extractor::MessageContext;

// ============================================================================
// EVENT TYPES
// ============================================================================

/// Connection state reported by the protocol client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Close,
}

/// Connection state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionUpdate {
    pub status: ConnectionStatus,
    /// Disconnect reason, when closing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Call lifecycle stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Accept,
    Offer,
    Reject,
    Ringing,
    Terminate,
    Timeout,
}

/// Normalized call notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallEvent {
    pub call_id: String,
    pub room_id: String,
    pub caller_id: String,
    /// Epoch milliseconds
    pub date: i64,
    #[serde(default)]
    pub offline: bool,
    pub status: CallStatus,
    #[serde(default)]
    pub is_video: bool,
    #[serde(default)]
    pub is_group: bool,
}

/// Event delivered to the application
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum AppEvent {
    Connection(ConnectionUpdate),
    Messages(Box<MessageContext>),
    Calls(CallEvent),
    /// Pass-through payload for an external webhook receiver
    Webhook(Value),
}

/// Handler registration key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Connection,
    Messages,
    Calls,
    Webhook,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Connection => "connection",
            EventName::Messages => "messages",
            EventName::Calls => "calls",
            EventName::Webhook => "webhook",
        }
    }
}

impl AppEvent {
    /// The name handlers register under
    pub fn name(&self) -> EventName {
        match self {
            AppEvent::Connection(_) => EventName::Connection,
            AppEvent::Messages(_) => EventName::Messages,
            AppEvent::Calls(_) => EventName::Calls,
            AppEvent::Webhook(_) => EventName::Webhook,
        }
    }
}

// ============================================================================
// DISPATCHER
// ============================================================================

type Handler = Arc<dyn Fn(&AppEvent) + Send + Sync>;

#[derive(Clone)]
struct WrappedHandler {
    id: usize,
    name: EventName,
    handler: Handler,
}

/// Handler registry
#[derive(Default)]
pub struct EventDispatcher {
    handlers: RwLock<Vec<WrappedHandler>>,
    next_id: AtomicUsize,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; returns its id for [`Self::off`]
    pub fn on<F>(&self, name: EventName, handler: F) -> usize
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.write().push(WrappedHandler {
            id,
            name,
            handler: Arc::new(handler),
        });
        tracing::debug!(id, event = name.as_str(), "Handler registered");
        id
    }

    /// Remove a handler; false when the id is unknown
    pub fn off(&self, id: usize) -> bool {
        let mut handlers = self.handlers.write();
        let before = handlers.len();
        handlers.retain(|h| h.id != id);
        handlers.len() != before
    }

    /// Deliver an event to every handler registered for its name
    pub fn emit(&self, event: &AppEvent) {
        let name = event.name();
        let matching: Vec<Handler> = self
            .handlers
            .read()
            .iter()
            .filter(|h| h.name == name)
            .map(|h| h.handler.clone())
            .collect();

        if matching.is_empty() {
            tracing::trace!(event = name.as_str(), "No handlers for event");
            return;
        }
        for handler in matching {
            handler(event);
        }
    }

    /// Handlers registered for `name`
    pub fn handler_count(&self, name: EventName) -> usize {
        self.handlers.read().iter().filter(|h| h.name == name).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn connection(status: ConnectionStatus) -> AppEvent {
        AppEvent::Connection(ConnectionUpdate { status, reason: None })
    }

    #[test]
    fn test_emit_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            dispatcher.on(EventName::Connection, move |_| seen.lock().push(tag));
        }
        let other = seen.clone();
        dispatcher.on(EventName::Calls, move |_| other.lock().push("calls"));

        dispatcher.emit(&connection(ConnectionStatus::Open));
        assert_eq!(*seen.lock(), vec!["first", "second"]);
    }

    #[test]
    fn test_off_removes_handler() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = dispatcher.on(EventName::Webhook, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        dispatcher.emit(&AppEvent::Webhook(json!({"a": 1})));
        assert!(dispatcher.off(id));
        assert!(!dispatcher.off(id));
        dispatcher.emit(&AppEvent::Webhook(json!({"a": 2})));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.handler_count(EventName::Webhook), 0);
    }

    #[test]
    fn test_handler_may_register_during_emit() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let inner = dispatcher.clone();
        dispatcher.on(EventName::Connection, move |_| {
            inner.on(EventName::Connection, |_| {});
        });

        dispatcher.emit(&connection(ConnectionStatus::Connecting));
        assert_eq!(dispatcher.handler_count(EventName::Connection), 2);
    }

    #[test]
    fn test_event_serialization() {
        let event = AppEvent::Calls(CallEvent {
            call_id: "C1".into(),
            room_id: "1@s.whatsapp.net".into(),
            caller_id: "1@s.whatsapp.net".into(),
            date: 1_700_000_000_000,
            offline: false,
            status: CallStatus::Offer,
            is_video: true,
            is_group: false,
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "calls");
        assert_eq!(json["data"]["callId"], "C1");
        assert_eq!(json["data"]["status"], "offer");
        assert_eq!(json["data"]["isVideo"], true);

        let json = serde_json::to_value(connection(ConnectionStatus::Close)).unwrap();
        assert_eq!(json, json!({"event": "connection", "data": {"status": "close"}}));
    }
}
