//! Observable synchronizer notifications.

use anyhow::Result;
use std::future::Future;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::listener::{EventKind, RawEvent, UnirepEvent};

/// Something subscribers can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A poll cycle started.
    PollStart,

    /// An event of `kind` was handled for a tracked attester.
    Event {
        /// Event type
        kind: EventKind,
        /// Decoded payload
        event: UnirepEvent,
        /// Source log
        raw: RawEvent,
        /// The store already held this event's effects
        redundant: bool,
    },

    /// Any event was committed, tracked or not.
    ProcessedEvent(RawEvent),
}

impl Notification {
    /// Event type, for per-event notifications.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            Notification::Event { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Subscriber registry.
///
/// Subscribers that fall behind skip the notifications they missed.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Notifier {
    /// Create a registry buffering up to `capacity` notifications per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Continuous subscription.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish to every current subscriber.
    pub fn emit(&self, notification: Notification) {
        // No subscribers is fine
        let _ = self.tx.send(notification);
    }

    /// One-shot subscription to the first notification matching `predicate`.
    ///
    /// The subscription starts when this is called, not when the future is
    /// first polled.
    pub fn once<F>(&self, predicate: F) -> impl Future<Output = Result<Notification>> + Send + 'static
    where
        F: Fn(&Notification) -> bool + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        async move {
            loop {
                match rx.recv().await {
                    Ok(n) if predicate(&n) => return Ok(n),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => anyhow::bail!("Notifier closed"),
                }
            }
        }
    }

    /// One-shot subscription to the next event of `kind`.
    pub fn once_event(
        &self,
        kind: EventKind,
    ) -> impl Future<Output = Result<Notification>> + Send + 'static {
        self.once(move |n| n.kind() == Some(kind))
    }
}
