//! Error taxonomy for the scheduling core.
//!
//! Mirrors the error kinds named by the presentation model rather than the
//! surrounding framework's own error vocabulary: most variants carry enough
//! context to decide whether a caller should retry, and `is_retryable` /
//! `is_fatal` centralise that decision so callers don't have to match on
//! variants themselves.

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the scheduling core.
#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("surrounding environment is not streams-aware")]
    IncompatibleContext,

    #[error("manifest rejected by parser: {reason}")]
    ManifestInvalid { reason: String },

    #[error("unsupported manifest URI scheme: {scheme}")]
    ManifestUri { scheme: String },

    #[error("manifest unreachable after {attempts} attempts: {reason}")]
    ManifestUnreachable { attempts: u32, reason: String },

    #[error("manifest parsed but contains no playable streams")]
    NoPlayableStreams,

    #[error("fragment download failed for stream {stream_id}: {reason}")]
    FragmentDownload {
        stream_id: u64,
        reason: String,
        retryable: bool,
    },

    #[error("live stream drifted outside the seek window")]
    LostSync,

    #[error("dynamic stream collection could not be resolved")]
    StreamFormatUnhandled,

    #[error("seek rejected: {reason}")]
    SeekRejected { reason: String },

    #[error("reactor task failed: {reason}")]
    ReactorTaskFailed { reason: String },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("internal invariant violated: {reason}")]
    Internal { reason: String },
}

impl DemuxError {
    pub fn manifest_invalid(reason: impl Into<String>) -> Self {
        Self::ManifestInvalid {
            reason: reason.into(),
        }
    }

    pub fn fragment_download(stream_id: u64, reason: impl Into<String>, retryable: bool) -> Self {
        Self::FragmentDownload {
            stream_id,
            reason: reason.into(),
            retryable,
        }
    }

    pub fn manifest_unreachable(attempts: u32, reason: impl Into<String>) -> Self {
        Self::ManifestUnreachable {
            attempts,
            reason: reason.into(),
        }
    }

    /// Whether a caller should retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            DemuxError::FragmentDownload { retryable, .. } => *retryable,
            DemuxError::ManifestUnreachable { .. } => true,
            DemuxError::IncompatibleContext
            | DemuxError::ManifestInvalid { .. }
            | DemuxError::ManifestUri { .. }
            | DemuxError::NoPlayableStreams
            | DemuxError::LostSync
            | DemuxError::StreamFormatUnhandled
            | DemuxError::SeekRejected { .. }
            | DemuxError::ReactorTaskFailed { .. }
            | DemuxError::Cancelled
            | DemuxError::Internal { .. } => false,
        }
    }

    /// Whether this error should be surfaced on the bus as a fatal condition
    /// rather than handled locally by the component that raised it.
    pub fn is_fatal(&self) -> bool {
        match self {
            DemuxError::IncompatibleContext
            | DemuxError::ManifestInvalid { .. }
            | DemuxError::ManifestUri { .. }
            | DemuxError::NoPlayableStreams
            | DemuxError::StreamFormatUnhandled
            | DemuxError::ReactorTaskFailed { .. }
            | DemuxError::Internal { .. } => true,
            DemuxError::ManifestUnreachable { attempts, .. } => *attempts >= 3,
            DemuxError::FragmentDownload { retryable, .. } => !retryable,
            DemuxError::LostSync | DemuxError::SeekRejected { .. } | DemuxError::Cancelled => {
                false
            }
        }
    }
}

/// Maximum consecutive fragment-download failures for a single Stream
/// before it transitions to `Errored` (spec §7, §8 scenario 6).
pub const MAX_DOWNLOAD_ERROR_COUNT: u32 = 3;

/// Maximum consecutive manifest-refresh failures before a fatal
/// `ManifestUnreachable` is raised (spec §7).
pub const MAX_MANIFEST_FAILURE_COUNT: u32 = 3;

/// Default ceiling used by retry policies when no caller-specified cap
/// applies; kept separate from the per-category max counts above.
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);
