//! Fan-out of relayed frames to every connection in a session room.
//!
//! Uses a tokio broadcast channel: one send reaches all subscribers, each
//! of which buffers up to `capacity` frames. Frames carry the id of the
//! connection they came from so that connection can skip its own echo.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::{InboundFrame, ProtocolError};

/// An encoded frame plus the connection that caused it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedFrame {
    pub origin: u64,
    pub text: String,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub subscribers: usize,
}

/// Broadcast group for one session room.
#[derive(Debug)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<RelayedFrame>>,
    capacity: usize,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is how many frames a slow subscriber may fall behind
    /// before it starts losing the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RelayedFrame>> {
        self.sender.subscribe()
    }

    /// Encode once and send to every subscriber. Returns how many
    /// receivers got it (the origin included, which filters it out).
    pub fn broadcast(&self, origin: u64, frame: &InboundFrame) -> Result<usize, ProtocolError> {
        let text = frame.encode()?;
        Ok(self.broadcast_raw(Arc::new(RelayedFrame { origin, text })))
    }

    /// Send a pre-encoded frame.
    pub fn broadcast_raw(&self, frame: Arc<RelayedFrame>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record frames a lagging subscriber lost.
    pub fn record_dropped(&self, count: u64) {
        self.frames_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}
