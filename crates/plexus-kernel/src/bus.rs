//! Signal bus.
//!
//! The signal bus is the only path between components.  It carries two kinds
//! of traffic over separate [`tokio::sync::broadcast`] channels:
//!
//! - **Signals** -- every [`Message`] sent by a component or a transport is
//!   wrapped in a [`Signal`] and fanned out to all subscribers.  The kernel
//!   drains them through [`SignalBus::generate`].
//! - **Notices** -- the info/debug/error side channel.  Each notice is also
//!   emitted as a `tracing` event, so the process log sees the same text a
//!   notice subscriber does.
//!
//! Signals wrap their message in an [`Arc`] so broadcasting to many
//! subscribers does not clone the payload.
//!
//! # Usage
//!
//! ```rust,no_run
//! # use plexus_kernel::{Message, SignalBus};
//! # async fn example() {
//! let bus = SignalBus::new(256);
//! let mut signals = bus.generate();
//!
//! bus.send(Message::new("storage", "store", serde_json::json!({})));
//!
//! let signal = signals.next().await.unwrap();
//! assert_eq!(signal.message().route(), "storage");
//! # }
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::message::Message;

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// Transport envelope around exactly one [`Message`].
#[derive(Debug, Clone)]
pub struct Signal {
    message: Arc<Message>,
}

impl Signal {
    pub fn new(message: Message) -> Self {
        Self {
            message: Arc::new(message),
        }
    }

    /// The wrapped message.
    pub fn message(&self) -> &Arc<Message> {
        &self.message
    }
}

// ---------------------------------------------------------------------------
// Notices
// ---------------------------------------------------------------------------

/// Severity of a side-channel notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "debug"),
            Self::Info => write!(f, "info"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// One entry on the info/debug/error side channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notice {
    pub severity: Severity,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Signal bus
// ---------------------------------------------------------------------------

/// Publish/subscribe bus backed by [`tokio::sync::broadcast`].
///
/// The bus is cheaply cloneable (`Arc`-backed) and `Send + Sync`.
#[derive(Clone)]
pub struct SignalBus {
    inner: Arc<SignalBusInner>,
}

struct SignalBusInner {
    signals: broadcast::Sender<Signal>,
    notices: broadcast::Sender<Notice>,
}

impl SignalBus {
    /// Create a new bus with the given per-channel capacity.
    ///
    /// If a subscriber falls behind by more than `capacity` signals it skips
    /// the ones it missed; see [`Signals::next`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (signals, _) = broadcast::channel(capacity);
        let (notices, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(SignalBusInner { signals, notices }),
        }
    }

    /// Wrap `message` in a [`Signal`] and publish it to every subscriber.
    ///
    /// Returns the number of receivers that will observe it.  With no
    /// subscribers the signal is dropped; this is normal during startup.
    pub fn send(&self, message: Message) -> usize {
        let message_id = message.id().to_string();
        match self.inner.signals.send(Signal::new(message)) {
            Ok(n) => {
                tracing::trace!(message_id = %message_id, receivers = n, "signal sent");
                n
            }
            Err(_) => {
                tracing::trace!(message_id = %message_id, "signal sent but no active receivers");
                0
            }
        }
    }

    /// Start a new lazy sequence of every signal sent from now on.
    ///
    /// Signals sent *before* this call are **not** replayed.
    pub fn generate(&self) -> Signals {
        Signals {
            receiver: self.inner.signals.subscribe(),
        }
    }

    /// Subscribe to the info/debug/error notice stream.
    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notices.subscribe()
    }

    /// Number of live signal subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.signals.receiver_count()
    }

    pub fn info(&self, text: impl fmt::Display) {
        let text = text.to_string();
        tracing::info!("{text}");
        self.notify(Severity::Info, text);
    }

    pub fn debug(&self, text: impl fmt::Display) {
        let text = text.to_string();
        tracing::debug!("{text}");
        self.notify(Severity::Debug, text);
    }

    pub fn error(&self, text: impl fmt::Display) {
        let text = text.to_string();
        tracing::error!("{text}");
        self.notify(Severity::Error, text);
    }

    fn notify(&self, severity: Severity, text: String) {
        // No notice subscribers is the common case outside tests.
        let _ = self.inner.notices.send(Notice {
            severity,
            text,
            timestamp: Utc::now(),
        });
    }
}

/// Receive side of [`SignalBus::generate`].
///
/// The sequence only ends when every [`SignalBus`] clone has been dropped,
/// which in practice means it lives as long as the process.
pub struct Signals {
    receiver: broadcast::Receiver<Signal>,
}

impl Signals {
    /// Wait for the next signal.
    ///
    /// A receiver that fell behind logs how many signals it lost and carries
    /// on with the oldest one still buffered.
    pub async fn next(&mut self) -> Option<Signal> {
        loop {
            match self.receiver.recv().await {
                Ok(signal) => return Some(signal),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "signal receiver lagged; signals dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn send_and_generate() {
        let bus = SignalBus::new(16);
        let mut signals = bus.generate();

        let receivers = bus.send(Message::reply("A1", "storage", "store", json!({"v": 1})));
        assert_eq!(receivers, 1);

        let signal = signals.next().await.expect("signal");
        assert_eq!(signal.message().id(), "A1");
        assert_eq!(signal.message().data()["v"], 1);
    }

    #[tokio::test]
    async fn every_generator_sees_the_same_message() {
        let bus = SignalBus::new(16);
        let mut a = bus.generate();
        let mut b = bus.generate();

        bus.send(Message::new("x", "y", json!(null)));

        let sa = a.next().await.expect("a");
        let sb = b.next().await.expect("b");
        assert!(Arc::ptr_eq(sa.message(), sb.message()));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_dropped() {
        let bus = SignalBus::new(16);
        assert_eq!(bus.send(Message::new("x", "y", json!(null))), 0);
    }

    #[tokio::test]
    async fn lagged_generator_skips_to_buffered_signals() {
        let bus = SignalBus::new(2);
        let mut signals = bus.generate();
        for i in 0..5 {
            bus.send(Message::reply(format!("m{i}"), "x", "y", json!(null)));
        }
        let first = signals.next().await.expect("signal");
        assert_eq!(first.message().id(), "m3");
    }

    #[tokio::test]
    async fn notices_carry_severity() {
        let bus = SignalBus::new(16);
        let mut notices = bus.subscribe_notices();

        bus.info("started");
        bus.error("boom");

        let first = notices.recv().await.expect("info");
        assert_eq!(first.severity, Severity::Info);
        assert_eq!(first.text, "started");

        let second = notices.recv().await.expect("error");
        assert_eq!(second.severity, Severity::Error);
        assert_eq!(second.text, "boom");
    }

    #[tokio::test]
    async fn subscriber_count_tracks_generators() {
        let bus = SignalBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        let g = bus.generate();
        assert_eq!(bus.subscriber_count(), 1);
        drop(g);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
