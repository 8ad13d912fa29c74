//! EventBus: the fan-out point between engines and IPC clients.
//!
//! spec.md §4.10 describes a synchronous handler-list bus; the teacher's
//! closest analogue is its `crossbeam_channel`-based signaling event stream.
//! Here handlers are plain closures collected under a lock — the daemon has
//! one event loop, so there is no need for a channel between producer and
//! consumer, only fan-out to however many IPC subscribers are attached.

use std::sync::RwLock;

/// Known event names. Registering a handler for a name outside this set is
/// allowed (logs a warning) since the supplemented `delivered` event, for
/// instance, still needs a home before it is added here.
pub const KNOWN_EVENTS: &[&str] = &[
    "message",
    "call_incoming",
    "peer_connected",
    "peer_disconnected",
    "file_received",
    "channel_content",
    "group_message",
    "delivered",
];

pub type Handler = Box<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>;

#[derive(Default)]
struct Registry {
    handlers: std::collections::HashMap<String, Vec<Handler>>,
}

#[derive(Default)]
pub struct EventBus {
    registry: RwLock<Registry>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    pub fn on(&self, event: &str, handler: Handler) {
        if !KNOWN_EVENTS.contains(&event) {
            tracing::warn!(event, "registering handler for unknown event name");
        }
        self.registry
            .write()
            .unwrap()
            .handlers
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    /// Invoke every handler registered for `event`. Handler errors are
    /// collected rather than propagated — one misbehaving subscriber must
    /// not prevent the others from observing the event.
    pub fn emit(&self, event: &str, payload: &serde_json::Value) -> Vec<String> {
        let registry = self.registry.read().unwrap();
        let mut errors = Vec::new();
        if let Some(handlers) = registry.handlers.get(event) {
            for handler in handlers {
                if let Err(e) = handler(payload) {
                    errors.push(e);
                }
            }
        }
        errors
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.registry
            .read()
            .unwrap()
            .handlers
            .get(event)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn emit_invokes_all_handlers_and_collects_errors() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let seen_clone = seen.clone();
        bus.on(
            "message",
            Box::new(move |_payload| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.on("message", Box::new(|_payload| Err("boom".to_string())));

        let errors = bus.emit("message", &json!({"content": "hi"}));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(errors, vec!["boom".to_string()]);
    }

    #[test]
    fn unknown_event_name_still_registers() {
        let bus = EventBus::new();
        bus.on("totally_custom", Box::new(|_| Ok(())));
        assert_eq!(bus.handler_count("totally_custom"), 1);
    }
}
