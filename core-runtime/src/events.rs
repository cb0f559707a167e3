//! # Event Bus System
//!
//! Decoupled notification channel built on `tokio::sync::broadcast`. The file
//! manager publishes [`FileEvent`]s here instead of calling back into the UI
//! layer directly: subscribers (UI bindings, quota accounting, telemetry)
//! listen independently and cannot block the manager.
//!
//! ## Usage
//!
//! ```rust
//! use core_runtime::events::{EventBus, FileEvent};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let bus = EventBus::new(100);
//! let mut stream = bus.subscribe();
//!
//! bus.emit(FileEvent::Updated { file_id: 7 }).ok();
//! assert_eq!(stream.recv().await.unwrap(), FileEvent::Updated { file_id: 7 });
//! # }
//! ```
//!
//! ## Error Handling
//!
//! `broadcast` can produce two receive errors:
//!
//! - `RecvError::Lagged(n)`: the subscriber was too slow and missed `n`
//!   events. Non-fatal; the subscriber keeps receiving new events.
//! - `RecvError::Closed`: all senders are gone. Treat as shutdown.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// Re-export commonly used types
pub use tokio::sync::broadcast::error::{RecvError, SendError};
pub use tokio::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// Notifications published by the file manager.
///
/// `file_id` values are the raw handle ids of the manager's main handles, kept
/// as plain integers here so the runtime crate stays independent of the core
/// handle types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum FileEvent {
    /// A previously unknown file entered the registry. `size` is the best
    /// size estimate at registration time, for quota accounting by the host.
    NewFile { size: i64 },
    /// A user-visible attribute of the file changed (location tier, ready
    /// size, name). Subscribers re-fetch the file object to observe details.
    Updated { file_id: i32 },
    /// The local copy of the file was deleted through the manager.
    Deleted { file_id: i32 },
}

impl FileEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &'static str {
        match self {
            FileEvent::NewFile { .. } => "New file registered",
            FileEvent::Updated { .. } => "File updated",
            FileEvent::Deleted { .. } => "Local file deleted",
        }
    }
}

/// Central broadcast channel for [`FileEvent`]s.
///
/// Cloning is cheap; clones publish into the same channel. The bus is fully
/// thread-safe and can be shared across tasks via `Arc`.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FileEvent>,
}

impl EventBus {
    /// Create a new event bus with the given buffer size.
    pub fn new(buffer_size: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer_size);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// Returns the number of subscribers that received the event, or an error
    /// when there are none. Publishers that don't care whether anyone is
    /// listening call `.ok()` on the result.
    pub fn emit(&self, event: FileEvent) -> Result<usize, SendError<FileEvent>> {
        self.sender.send(event)
    }

    /// Subscribe to all events published after this call.
    pub fn subscribe(&self) -> Receiver<FileEvent> {
        self.sender.subscribe()
    }

    /// Number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(FileEvent::NewFile { size: 1000 }).unwrap();

        assert_eq!(first.recv().await.unwrap(), FileEvent::NewFile { size: 1000 });
        assert_eq!(second.recv().await.unwrap(), FileEvent::NewFile { size: 1000 });
    }

    #[test]
    fn test_emit_without_subscribers_is_an_error() {
        let bus = EventBus::new(8);
        assert!(bus.emit(FileEvent::Deleted { file_id: 3 }).is_err());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_count_tracks_receivers() {
        let bus = EventBus::new(8);
        let one = bus.subscribe();
        let two = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        drop(one);
        drop(two);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
