//! Event system for publishing outcomes
//!
//! This module provides an in-process event bus that the publishing queue
//! and the enforcer report to. Notification delivery, analytics and the CLI
//! consume it without the core knowing they exist.
//!
//! # Architecture
//!
//! The event bus uses `tokio::sync::broadcast` for multi-subscriber support.
//! Events are emitted after the state change they describe has been
//! committed, so a subscriber never sees an event for a write that was rolled
//! back.
//!
//! # Non-Blocking Behavior
//!
//! If no subscribers exist, events are dropped immediately. Subscribers can
//! lag without blocking emitters.
//!
//! # Example
//!
//! ```no_run
//! use libautopost::service::events::{EventBus, Event};
//! use libautopost::types::Platform;
//!
//! # async fn example() {
//! let event_bus = EventBus::new(100);
//! let mut receiver = event_bus.subscribe();
//!
//! event_bus.emit(Event::PostPublished {
//!     post_id: "abc123".to_string(),
//!     platform: Platform::LinkedIn,
//!     platform_post_id: "urn:li:share:1".to_string(),
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ErrorClass;
use crate::types::Platform;

/// Event receiver type alias
pub type EventReceiver = broadcast::Receiver<Event>;

/// Event bus for distributing publishing events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus with the specified capacity
    ///
    /// The capacity determines how many events can be buffered per subscriber
    /// before older events are dropped (if the subscriber is lagging).
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: Event) {
        // send() only fails when nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Events exposed to collaborators outside the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A post went live and its quota unit was committed
    PostPublished {
        post_id: String,
        platform: Platform,
        platform_post_id: String,
    },

    /// A post reached `Failed`; its quota unit was released
    PostFailed {
        post_id: String,
        platform: Platform,
        class: ErrorClass,
        reason: String,
    },

    /// A post was withdrawn or dropped at a cycle boundary
    PostCancelled {
        post_id: String,
        platform: Platform,
        reason: String,
    },

    /// The subscriber's cycle ends soon with reserved posts still unpublished
    QuotaCycleEnding {
        subscriber_id: String,
        cycle_id: i64,
        unpublished_count: i64,
        cycle_end: i64,
    },
}
