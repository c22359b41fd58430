//! Bounded, load-shedding channels.
//!
//! Producers never wait: when the queue is full the newest message is dropped and
//! counted. This keeps the broker's delivery context free of back-pressure from
//! a slow store or a slow client; only the lagging consumer loses messages.
//!
//! Senders are cloneable (many producers); the receiver is not (single consumer).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};

/// Outcome of [`ChannelSender::offer`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Offer {
    /// The message was queued.
    Accepted,
    /// The queue was full; the message was discarded.
    Dropped,
    /// The receiver is gone; the message was discarded.
    Closed,
}

/// Create a bounded channel holding at most `capacity` messages (minimum 1).
pub fn bounded<M>(capacity: usize) -> (ChannelSender<M>, ChannelReceiver<M>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        ChannelSender {
            tx,
            dropped: dropped.clone(),
        },
        ChannelReceiver { rx, dropped },
    )
}

pub struct ChannelSender<M> {
    tx: mpsc::Sender<M>,
    dropped: Arc<AtomicU64>,
}

impl<M> ChannelSender<M> {
    /// Queue a message without waiting.
    pub fn offer(&self, message: M) -> Offer {
        match self.tx.try_send(message) {
            Ok(()) => Offer::Accepted,
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Offer::Dropped
            }
            Err(TrySendError::Closed(_)) => Offer::Closed,
        }
    }

    /// Messages discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<M> Clone for ChannelSender<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: self.dropped.clone(),
        }
    }
}

impl<M> core::fmt::Debug for ChannelSender<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelSender")
            .field("capacity", &self.tx.max_capacity())
            .field("dropped", &self.dropped())
            .finish()
    }
}

pub struct ChannelReceiver<M> {
    rx: mpsc::Receiver<M>,
    dropped: Arc<AtomicU64>,
}

impl<M> ChannelReceiver<M> {
    /// Wait for the next message; `None` once every sender is gone (or after
    /// [`close`](Self::close)) and the queue is drained.
    pub async fn recv(&mut self) -> Option<M> {
        self.rx.recv().await
    }

    /// Take a queued message if one is available.
    pub fn try_recv(&mut self) -> Option<M> {
        self.rx.try_recv().ok()
    }

    /// Refuse further messages. Already queued messages can still be received.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Messages discarded because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<M> core::fmt::Debug for ChannelReceiver<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelReceiver")
            .field("dropped", &self.dropped())
            .finish()
    }
}
