//! Tunnel status and change notification.
//!
//! [`StatusBroadcaster`] holds the current [`TunnelStatus`] and fans changes
//! out to subscribers without waiting for them:
//!
//! ```text
//!   set_status()
//!       │              (Arc-clone per subscriber)
//!       ├──────────► [queue L1] ─► worker L1 ─► on_status()
//!       └──────────► [queue LN] ─► worker LN ─► on_status()
//! ```
//!
//! Each subscriber sees changes in sequence order. A panicking listener is
//! logged and keeps receiving later changes; other listeners are unaffected.
//! Workers are tokio tasks, so `subscribe` must be called inside a runtime.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, warn};
use tokio::sync::mpsc;

/// Externally visible tunnel state. `Error` always carries a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelStatus {
    Stopped,
    Running,
    Error(String),
}

/// Discriminant of [`TunnelStatus`] without the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusKind {
    Stopped,
    Running,
    Error,
}

impl TunnelStatus {
    /// Builds an `Error` status, substituting a placeholder for an empty message.
    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        let trimmed = message.trim();
        if trimmed.is_empty() {
            TunnelStatus::Error("unknown error".to_string())
        } else {
            TunnelStatus::Error(trimmed.to_string())
        }
    }

    pub fn kind(&self) -> StatusKind {
        match self {
            TunnelStatus::Stopped => StatusKind::Stopped,
            TunnelStatus::Running => StatusKind::Running,
            TunnelStatus::Error(_) => StatusKind::Error,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            TunnelStatus::Error(message) => Some(message),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TunnelStatus::Running)
    }
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Stopped => f.write_str("stopped"),
            TunnelStatus::Running => f.write_str("running"),
            TunnelStatus::Error(message) => write!(f, "error: {message}"),
        }
    }
}

/// One status transition as delivered to listeners.
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// Strictly increasing per broadcaster.
    pub sequence: u64,
    pub previous: TunnelStatus,
    pub current: TunnelStatus,
    pub at: DateTime<Utc>,
}

/// Receiver of status changes.
///
/// Closures `Fn(&StatusChange)` implement this trait directly.
pub trait StatusListener: Send + Sync + 'static {
    fn on_status(&self, change: &StatusChange);

    /// Name used in log messages.
    fn name(&self) -> &str {
        "status-listener"
    }
}

impl<F> StatusListener for F
where
    F: Fn(&StatusChange) + Send + Sync + 'static,
{
    fn on_status(&self, change: &StatusChange) {
        self(change)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    active: Arc<AtomicBool>,
    sender: mpsc::UnboundedSender<Arc<StatusChange>>,
}

struct BroadcastState {
    current: TunnelStatus,
    sequence: u64,
    next_id: u64,
    subscribers: Vec<Subscriber>,
}

/// Current status plus the set of subscribers to notify on change.
pub struct StatusBroadcaster {
    state: Mutex<BroadcastState>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    /// Starts in `Stopped`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BroadcastState {
                current: TunnelStatus::Stopped,
                sequence: 0,
                next_id: 1,
                subscribers: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BroadcastState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn current(&self) -> TunnelStatus {
        self.lock().current.clone()
    }

    /// Message of the current error, if the status is `Error`.
    pub fn last_error(&self) -> Option<String> {
        self.lock().current.error_message().map(str::to_string)
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Registers `listener` and spawns its delivery worker.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn subscribe(&self, listener: Arc<dyn StatusListener>) -> SubscriptionId {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Arc<StatusChange>>();
        let active = Arc::new(AtomicBool::new(true));

        let mut state = self.lock();
        let id = SubscriptionId(state.next_id);
        state.next_id += 1;
        state.subscribers.push(Subscriber {
            id,
            active: Arc::clone(&active),
            sender,
        });
        drop(state);

        tokio::spawn(async move {
            let mut last_delivered = 0;
            while let Some(change) = receiver.recv().await {
                if !active.load(Ordering::Acquire) {
                    break;
                }
                if change.sequence <= last_delivered {
                    continue;
                }
                last_delivered = change.sequence;

                let delivered = catch_unwind(AssertUnwindSafe(|| listener.on_status(&change)));
                if delivered.is_err() {
                    warn!(
                        "Status listener '{}' panicked on change #{}",
                        listener.name(),
                        change.sequence
                    );
                }
            }
            debug!("Status listener '{}' detached", listener.name());
        });

        id
    }

    /// Removes a subscription. Unknown ids are ignored.
    ///
    /// Once this returns, no further change is delivered to the listener.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut state = self.lock();
        if let Some(pos) = state.subscribers.iter().position(|s| s.id == id) {
            let subscriber = state.subscribers.remove(pos);
            subscriber.active.store(false, Ordering::Release);
        }
    }

    /// Updates the status and notifies subscribers if it changed.
    ///
    /// Returns whether a change was recorded. Never waits on listeners.
    pub fn set_status(&self, status: TunnelStatus) -> bool {
        let mut state = self.lock();
        if state.current == status {
            return false;
        }

        state.sequence += 1;
        let previous = std::mem::replace(&mut state.current, status.clone());
        let change = Arc::new(StatusChange {
            sequence: state.sequence,
            previous,
            current: status,
            at: Utc::now(),
        });
        debug!(
            "Status change #{}: {} -> {}",
            change.sequence, change.previous, change.current
        );

        state
            .subscribers
            .retain(|s| s.sender.send(Arc::clone(&change)).is_ok());
        true
    }

    /// Detaches every subscriber; their workers exit once drained.
    pub fn close(&self) {
        let mut state = self.lock();
        for subscriber in state.subscribers.drain(..) {
            subscriber.active.store(false, Ordering::Release);
        }
    }
}
