//! External collaborator traits (spec §6). These are the boundary this
//! crate does not cross: HTTP transport, manifest-dialect parsing,
//! elementary-stream parsing, and the downstream sink are all represented
//! as trait objects a caller supplies. Production HLS/DASH/MSS
//! implementations of `DemuxerFormat` are out of scope (spec §1, §9).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::DemuxError;
use crate::track::{StreamEvent, TrackKind};

/// Flags accepted by `DownloadHelper::submit` (spec §6).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadFlags {
    pub compress: bool,
    pub force_refresh: bool,
    pub header_only: bool,
}

/// A pending or completed download, returned by `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DownloadHandle(pub u64);

/// A download request (spec §6 "Download collaborator").
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub uri: String,
    pub byte_range: Option<(u64, Option<u64>)>,
    pub flags: DownloadFlags,
}

/// Outcome of a finished download.
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub body: Bytes,
    pub content_type: Option<String>,
}

/// HTTP transport boundary. The core never opens a socket itself.
#[async_trait]
pub trait DownloadHelper: Send + Sync {
    async fn submit(
        &self,
        request: DownloadRequest,
    ) -> Result<DownloadOutcome, DemuxError>;

    fn set_user_agent(&self, user_agent: &str);
    fn set_cookies(&self, cookies: &[String]);
    fn set_referer(&self, referer: Option<&str>);
}

/// Per-stream fragment parsing boundary: turns fragment bytes into timed
/// elementary events/buffers delivered to a specific track sink. The core
/// discards the parser's own stream-start/stream-collection (it emits its
/// own qualified ones) and suppresses EOS during a pending replacement —
/// see `Track::queue_event`.
pub trait ParserSink: Send + Sync {
    fn deliver(&self, track_stream_id: &str, event: StreamEvent);
}

pub trait FragmentParser: Send + Sync {
    fn feed(&self, data: &[u8], sink: &dyn ParserSink) -> Result<(), DemuxError>;
}

/// Manifest-dialect boundary (spec §6 "Demuxer-format collaborator").
/// Concrete HLS/DASH/MSS implementations live outside this crate.
pub trait DemuxerFormat: Send + Sync {
    fn process_manifest(&self, bytes: &[u8]) -> Result<ManifestOutcome, DemuxError>;
    fn update_manifest_data(&self, bytes: &[u8]) -> Result<ManifestOutcome, DemuxError>;

    fn duration(&self) -> Option<Duration>;
    fn is_live(&self) -> bool;
    fn period_start_time(&self) -> Duration;
    fn has_next_period(&self) -> bool;
    fn advance_period(&self) -> Result<(), DemuxError>;

    fn manifest_update_interval(&self) -> Duration;
    fn requires_periodical_playlist_update(&self) -> bool;

    /// `(start, stop)` bounding valid seek positions for live content.
    fn live_seek_range(&self) -> Option<(Duration, Duration)>;

    fn seek(&self, position: Duration, flags: SeekFlags) -> Result<Duration, DemuxError>;

    fn update_fragment_info(&self, stream_id: &str) -> Result<FragmentUpdate, DemuxError>;
    fn has_next_fragment(&self, stream_id: &str) -> bool;
    fn advance_fragment(&self, stream_id: &str) -> Result<(), DemuxError>;

    fn need_another_chunk(&self, _stream_id: &str) -> bool {
        false
    }
    fn select_bitrate(&self, _stream_id: &str, _target_bps: u64) -> Option<String> {
        None
    }
    fn presentation_offset(&self) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone)]
pub struct ManifestOutcome {
    pub streams: Vec<StreamDescriptor>,
}

#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub stream_id: String,
    pub kind: TrackKind,
    pub select_by_default: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SeekFlags {
    pub flush: bool,
    pub accurate: bool,
    pub snap_before: bool,
    pub snap_after: bool,
    pub instant_rate_change: bool,
}

/// Outcome of `update_fragment_info` (spec §4.3).
#[derive(Debug, Clone)]
pub enum FragmentUpdate {
    Ok(crate::stream::FragmentInfo),
    Eos,
    NeedManifestUpdate,
    Busy,
}

/// Downstream sink boundary (spec §6 "Downstream consumer"). A `BusSink`
/// handles notifications; `DownstreamSlotSink` handles the actual timed
/// data path for one Output Slot.
pub trait DownstreamSlotSink: Send + Sync {
    fn push(&self, slot_kind: TrackKind, item: crate::track::QueuedItem) -> FlowStatus;
}

/// Combined flow status (spec §4.4, §8 P5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlowStatus {
    Error = 0,
    NotNegotiated = 1,
    NotLinked = 2,
    Flushing = 3,
    Eos = 4,
    Ok = 5,
}

impl FlowStatus {
    pub fn is_fatal_for_pump(&self) -> bool {
        matches!(self, FlowStatus::Error | FlowStatus::NotNegotiated)
    }
}
