//! Notification bus (spec §6 "Notifications").
//!
//! The core never owns a concrete message transport; it posts
//! `Notification` values to whatever `BusSink` the caller supplies (a
//! channel, a GObject-style signal emitter, a test collector — anything).

use crate::error::DemuxError;

/// A notification posted to the bus-like channel described in spec §6.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Posted on period change or dynamic-track discovery.
    StreamCollection { period_seqnum: u64, stream_count: usize },
    /// Posted once every selected track has become active.
    StreamsSelected { selection_seqnum: u64 },
    /// Integer percent, monotone within a buffering state; re-asserted when
    /// the state transitions from >=100 back down to <1.
    Buffering { percent: u8 },
    /// Posted on non-live duration updates.
    DurationChanged,
    /// Carries download-timing statistics for a manifest URI.
    AdaptiveStreamingStatistics {
        manifest_uri: String,
        last_fetch: std::time::Duration,
    },
    /// A fatal condition: manifest update exhaustion, unknown stream
    /// formats, and the other fatal kinds in `DemuxError::is_fatal`.
    Error(DemuxErrorReport),
}

/// A bus-friendly, cloneable snapshot of a fatal error: `DemuxError` itself
/// is not `Clone` (thiserror-derived enums commonly aren't, to keep
/// formatting cheap), so the bus carries a rendered message instead.
#[derive(Debug, Clone)]
pub struct DemuxErrorReport {
    pub message: String,
}

impl From<&DemuxError> for DemuxErrorReport {
    fn from(e: &DemuxError) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

/// Capability trait for posting notifications; a thin seam so the core
/// never depends on a concrete channel type.
pub trait BusSink: Send + Sync {
    fn post(&self, notification: Notification);
}

/// A `BusSink` backed by a bounded `tokio::sync::mpsc` channel, used when
/// the caller wants an async stream of notifications rather than a
/// synchronous callback.
pub struct ChannelBus {
    tx: tokio::sync::mpsc::Sender<Notification>,
}

impl ChannelBus {
    pub fn new(tx: tokio::sync::mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }
}

impl BusSink for ChannelBus {
    fn post(&self, notification: Notification) {
        if self.tx.try_send(notification).is_err() {
            tracing::warn!("bus channel full or closed, dropping notification");
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    pub struct RecordingBus {
        pub notifications: Mutex<Vec<Notification>>,
    }

    impl BusSink for RecordingBus {
        fn post(&self, notification: Notification) {
            self.notifications.lock().push(notification);
        }
    }
}
