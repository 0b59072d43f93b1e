//! Counter-only business-event pipeline sharing the Buffer with performance
//! events (spec §4.9). Sample rotation and the long-tail probability live
//! in [`crate::aggregator`], since they only apply once events are drained
//! and grouped by name; this module is just the ingestion side.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::buffer::{Buffer, PushOutcome};
use crate::config::Config;
use crate::event::{BufferItem, CustomEvent};

pub struct EventsPath {
    config: Config,
    buffer: Arc<Buffer>,
}

impl EventsPath {
    pub fn new(config: Config, buffer: Arc<Buffer>) -> Self {
        Self { config, buffer }
    }

    /// Records one occurrence of `name`. A no-op (and never even reaches
    /// the buffer) when `events_enabled` is false.
    pub fn track(&self, name: impl Into<String>, payload: Option<Value>) -> PushOutcome {
        if !self.config.events_enabled {
            return PushOutcome::Dropped;
        }
        self.buffer.push(BufferItem::Custom(CustomEvent {
            name: name.into(),
            payload,
            recorded_at: Utc::now(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_events_never_reach_the_buffer() {
        let mut config = Config::default();
        config.events_enabled = false;
        let buffer = Arc::new(Buffer::new(config.max_buffer_memory));
        let events = EventsPath::new(config, buffer.clone());

        events.track("signup_completed", None);
        assert_eq!(buffer.size(), 0);
    }

    #[test]
    fn enabled_events_are_pushed_as_custom_items() {
        let config = Config::default();
        let buffer = Arc::new(Buffer::new(config.max_buffer_memory));
        let events = EventsPath::new(config, buffer.clone());

        events.track("signup_completed", Some(serde_json::json!({"plan": "pro"})));
        let drained = buffer.drain();
        assert_eq!(drained.len(), 1);
        match &drained[0] {
            BufferItem::Custom(c) => assert_eq!(c.name, "signup_completed"),
            _ => panic!("expected Custom"),
        }
    }
}
