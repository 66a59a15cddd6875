//! Stream: a producer that fetches fragments for one rendition and feeds
//! one or more Tracks (spec §3, §4.3).
//!
//! The state machine itself (`StreamState`, `Stream::apply_*`) is plain,
//! synchronous, and testable in isolation; the actual fragment download is
//! driven by `download_fragment`, an async helper in the shape of the
//! teacher's `hls/fetcher.rs` + `hls/retry.rs` combination, dispatched by
//! the Reactor and fed back into the state machine via its completion.

use std::collections::VecDeque;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collaborators::{DemuxerFormat, DownloadHelper, DownloadFlags, DownloadRequest, FragmentParser, FragmentUpdate, ParserSink, SeekFlags};
use crate::error::{DemuxError, MAX_DOWNLOAD_ERROR_COUNT};
use crate::period::{PeriodId, StreamId};
use crate::retry::{retry_with_backoff, RetryAction, RetryPolicy};
use crate::track::{TrackId, TrackKind};

#[derive(Debug, Clone)]
pub struct FragmentInfo {
    pub stream_time: Duration,
    pub duration: Duration,
    pub uri: String,
    pub byte_range: Option<(u64, Option<u64>)>,
    pub header_uri: Option<String>,
    pub index_uri: Option<String>,
    pub chunk_size: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Stopped,
    Restart,
    StartFragment,
    WaitingLive,
    WaitingOutputSpace,
    WaitingManifestUpdate,
    Downloading,
    Eos,
    Errored,
}

/// Moving average of bitrate over the last `window` fragments (spec §3
/// "Download stats for bitrate estimation").
pub struct BandwidthEstimator {
    window: usize,
    samples: VecDeque<(u64, Duration)>,
}

impl BandwidthEstimator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        if elapsed.is_zero() {
            return;
        }
        self.samples.push_back((bytes, elapsed));
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }
    }

    /// Bits per second averaged over the retained window, or `None` if no
    /// samples have been recorded yet.
    pub fn estimate_bps(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let total_bytes: u64 = self.samples.iter().map(|(b, _)| b).sum();
        let total_time: Duration = self.samples.iter().map(|(_, d)| *d).sum();
        if total_time.is_zero() {
            return None;
        }
        Some((total_bytes * 8) as u64 / total_time.as_secs_f64().max(1e-6) as u64)
    }
}

pub struct Stream {
    pub id: StreamId,
    pub period_id: PeriodId,
    pub kind: TrackKind,
    pub tracks: Vec<TrackId>,
    pub state: StreamState,
    pub current_fragment: Option<FragmentInfo>,
    pub error_count: u32,
    /// True while this Stream has not yet produced a concrete track set
    /// (dynamic multiplex case; spec §3).
    pub pending_tracks: bool,
    /// Next global-output running time at which this Stream should be
    /// reconsidered (spec §4.3 "Backpressure").
    pub next_input_wakeup_time: Option<i64>,
    pub bandwidth: BandwidthEstimator,
    pub header_delivered: bool,
}

impl Stream {
    pub fn new(id: StreamId, period_id: PeriodId, kind: TrackKind) -> Self {
        Self {
            id,
            period_id,
            kind,
            tracks: Vec::new(),
            state: StreamState::Stopped,
            current_fragment: None,
            error_count: 0,
            pending_tracks: false,
            next_input_wakeup_time: None,
            bandwidth: BandwidthEstimator::new(20),
            header_delivered: false,
        }
    }

    /// `start()` (spec §4.3): Stopped -> StartFragment.
    pub fn start(&mut self) {
        self.error_count = 0;
        self.header_delivered = false;
        self.state = StreamState::StartFragment;
    }

    /// `stop()`: in-flight downloads are cancelled by the caller via the
    /// Stream's `CancellationToken`; the state machine itself just records
    /// that the Stream is no longer running.
    pub fn stop(&mut self) {
        self.state = StreamState::Stopped;
    }

    /// Apply the result of `update_fragment_info` (spec §4.3 state table).
    pub fn apply_fragment_update(&mut self, update: FragmentUpdate, is_live: bool) {
        match update {
            FragmentUpdate::Ok(info) => {
                self.current_fragment = Some(info);
                self.state = if is_live {
                    StreamState::WaitingLive
                } else {
                    StreamState::Downloading
                };
            }
            FragmentUpdate::Eos => self.state = StreamState::Eos,
            FragmentUpdate::NeedManifestUpdate => {
                self.state = StreamState::WaitingManifestUpdate
            }
            FragmentUpdate::Busy => {}
        }
    }

    /// The live wait has elapsed; proceed to download.
    pub fn live_wait_elapsed(&mut self) {
        if self.state == StreamState::WaitingLive {
            self.state = StreamState::Downloading;
        }
    }

    /// A manifest refresh completed; wake streams parked waiting for one
    /// (spec §4.5 "Wakeups").
    pub fn manifest_refreshed(&mut self) {
        if self.state == StreamState::WaitingManifestUpdate {
            self.state = StreamState::StartFragment;
        }
    }

    /// Output space became available; wake a backpressured stream
    /// (spec §4.3, §4.4 `check_input_wakeup`).
    pub fn output_space_available(&mut self) {
        if self.state == StreamState::WaitingOutputSpace {
            self.state = StreamState::StartFragment;
        }
        self.next_input_wakeup_time = None;
    }

    /// A fragment finished downloading successfully; advance, and park in
    /// `WaitingOutputSpace` if the caller reports the track is over its
    /// high watermark.
    pub fn fragment_complete(&mut self, over_high_watermark: bool, next_wakeup: Option<i64>) {
        self.error_count = 0;
        if over_high_watermark {
            self.state = StreamState::WaitingOutputSpace;
            self.next_input_wakeup_time = next_wakeup;
        } else {
            self.state = StreamState::StartFragment;
        }
    }

    /// Record a transient error on the current fragment; returns `true` if
    /// the Stream is now `Errored` (retry budget exhausted).
    pub fn record_error(&mut self) -> bool {
        self.error_count += 1;
        if self.error_count >= MAX_DOWNLOAD_ERROR_COUNT {
            self.state = StreamState::Errored;
            true
        } else {
            self.state = StreamState::StartFragment;
            false
        }
    }

    /// `seek(forward, flags, ts) -> final_ts` (spec §4.3, `gst_adaptive_demux2_stream_seek`):
    /// the real per-stream SNAP seek. Asks the `DemuxerFormat` collaborator
    /// to resolve `ts` to the nearest real fragment boundary for this
    /// stream, then transitions to `Restart` so the download loop
    /// recomputes its segment starting from the snapped position.
    pub fn seek_to(
        &mut self,
        format: &dyn DemuxerFormat,
        flags: SeekFlags,
        ts: Duration,
    ) -> Result<Duration, DemuxError> {
        let snapped = format.seek(ts, flags)?;
        self.state = StreamState::Restart;
        self.current_fragment = None;
        Ok(snapped)
    }

    /// Reposition this stream to `final_ts` without a fresh collaborator
    /// call: used to align every other stream to the position a SNAP seek
    /// already resolved on one chosen stream (spec §4.8 step 10,
    /// `gst_adaptive_demux_setup_streams_for_restart`).
    pub fn restart_at(&mut self, final_ts: Duration) -> Duration {
        self.state = StreamState::Restart;
        self.current_fragment = None;
        final_ts
    }

    pub fn restart_to_start_fragment(&mut self) {
        if self.state == StreamState::Restart {
            self.state = StreamState::StartFragment;
        }
    }
}

/// Download one fragment with retry-and-backoff, feeding the result to the
/// stream's parser sink. Grounded on the teacher's `retry_with_backoff` +
/// `SegmentScheduler` dispatch shape, generalised away from HLS specifics.
pub async fn download_fragment(
    stream_id: StreamId,
    info: &FragmentInfo,
    policy: &RetryPolicy,
    token: &CancellationToken,
    downloader: &dyn DownloadHelper,
    parser: &dyn FragmentParser,
    sink: &dyn ParserSink,
    track_stream_id: &str,
) -> Result<usize, DemuxError> {
    let outcome = retry_with_backoff(policy, token, |attempt| {
        let uri = info.uri.clone();
        let byte_range = info.byte_range;
        async move {
            debug!(stream_id = stream_id.0, attempt, uri = %uri, "fetching fragment");
            let request = DownloadRequest {
                uri,
                byte_range,
                flags: DownloadFlags::default(),
            };
            match downloader.submit(request).await {
                Ok(outcome) => RetryAction::Success(outcome),
                Err(e) if e.is_retryable() => RetryAction::Retry(e),
                Err(e) => RetryAction::Fail(e),
            }
        }
    })
    .await?;

    let len = outcome.body.len();
    parser.feed(&outcome.body, sink)?;
    Ok(len)
}

/// Call the `DemuxerFormat` collaborator to advance the fragment cursor,
/// translating its verdict into a stream-local `FragmentUpdate` and warning
/// (never erroring the bus) on a single transient failure, per spec §8
/// scenario 6.
pub fn update_fragment_info(
    format: &dyn DemuxerFormat,
    stream_id: &str,
) -> Result<FragmentUpdate, DemuxError> {
    match format.update_fragment_info(stream_id) {
        Ok(update) => Ok(update),
        Err(e) if e.is_retryable() => {
            warn!(stream_id, error = %e, "transient fragment-info error");
            Ok(FragmentUpdate::Busy)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment() -> FragmentInfo {
        FragmentInfo {
            stream_time: Duration::ZERO,
            duration: Duration::from_secs(6),
            uri: "https://example.invalid/seg0.ts".into(),
            byte_range: None,
            header_uri: None,
            index_uri: None,
            chunk_size: None,
        }
    }

    #[test]
    fn start_resets_error_count_and_moves_to_start_fragment() {
        let mut s = Stream::new(StreamId(0), PeriodId(0), TrackKind::Video);
        s.error_count = 2;
        s.start();
        assert_eq!(s.state, StreamState::StartFragment);
        assert_eq!(s.error_count, 0);
    }

    #[test]
    fn fragment_ok_for_live_parks_in_waiting_live() {
        let mut s = Stream::new(StreamId(0), PeriodId(0), TrackKind::Video);
        s.apply_fragment_update(FragmentUpdate::Ok(fragment()), true);
        assert_eq!(s.state, StreamState::WaitingLive);
    }

    #[test]
    fn fragment_ok_for_vod_goes_straight_to_downloading() {
        let mut s = Stream::new(StreamId(0), PeriodId(0), TrackKind::Video);
        s.apply_fragment_update(FragmentUpdate::Ok(fragment()), false);
        assert_eq!(s.state, StreamState::Downloading);
    }

    #[test]
    fn retries_twice_then_succeeds_does_not_error() {
        let mut s = Stream::new(StreamId(0), PeriodId(0), TrackKind::Video);
        s.state = StreamState::Downloading;
        assert!(!s.record_error());
        assert!(!s.record_error());
        assert_eq!(s.state, StreamState::StartFragment);
        s.fragment_complete(false, None);
        assert_eq!(s.error_count, 0);
    }

    #[test]
    fn third_consecutive_failure_is_fatal_for_the_stream() {
        let mut s = Stream::new(StreamId(0), PeriodId(0), TrackKind::Video);
        s.state = StreamState::Downloading;
        assert!(!s.record_error());
        assert!(!s.record_error());
        assert!(s.record_error());
        assert_eq!(s.state, StreamState::Errored);
    }

    #[test]
    fn fragment_complete_over_watermark_parks_waiting_output_space() {
        let mut s = Stream::new(StreamId(0), PeriodId(0), TrackKind::Video);
        s.state = StreamState::Downloading;
        s.fragment_complete(true, Some(123));
        assert_eq!(s.state, StreamState::WaitingOutputSpace);
        assert_eq!(s.next_input_wakeup_time, Some(123));

        s.output_space_available();
        assert_eq!(s.state, StreamState::StartFragment);
        assert_eq!(s.next_input_wakeup_time, None);
    }

    #[test]
    fn bandwidth_estimator_averages_over_window() {
        let mut bw = BandwidthEstimator::new(2);
        bw.record(1_000_000, Duration::from_secs(1));
        bw.record(1_000_000, Duration::from_secs(1));
        bw.record(1_000_000, Duration::from_secs(1));
        // Window of 2: only the last two samples count.
        assert_eq!(bw.estimate_bps(), Some(8_000_000));
    }

    #[test]
    fn restart_at_transitions_to_restart() {
        let mut s = Stream::new(StreamId(0), PeriodId(0), TrackKind::Video);
        s.state = StreamState::Downloading;
        let ts = s.restart_at(Duration::from_secs(7));
        assert_eq!(ts, Duration::from_secs(7));
        assert_eq!(s.state, StreamState::Restart);
        assert!(s.current_fragment.is_none());
        s.restart_to_start_fragment();
        assert_eq!(s.state, StreamState::StartFragment);
    }

    struct SnappingFormat {
        snap_to: Duration,
    }

    impl DemuxerFormat for SnappingFormat {
        fn process_manifest(&self, _: &[u8]) -> Result<crate::collaborators::ManifestOutcome, DemuxError> {
            unimplemented!()
        }
        fn update_manifest_data(&self, _: &[u8]) -> Result<crate::collaborators::ManifestOutcome, DemuxError> {
            unimplemented!()
        }
        fn duration(&self) -> Option<Duration> {
            None
        }
        fn is_live(&self) -> bool {
            false
        }
        fn period_start_time(&self) -> Duration {
            Duration::ZERO
        }
        fn has_next_period(&self) -> bool {
            false
        }
        fn advance_period(&self) -> Result<(), DemuxError> {
            Ok(())
        }
        fn manifest_update_interval(&self) -> Duration {
            Duration::from_secs(6)
        }
        fn requires_periodical_playlist_update(&self) -> bool {
            false
        }
        fn live_seek_range(&self) -> Option<(Duration, Duration)> {
            None
        }
        fn seek(&self, _position: Duration, _flags: SeekFlags) -> Result<Duration, DemuxError> {
            Ok(self.snap_to)
        }
        fn update_fragment_info(&self, _: &str) -> Result<FragmentUpdate, DemuxError> {
            Ok(FragmentUpdate::Eos)
        }
        fn has_next_fragment(&self, _: &str) -> bool {
            false
        }
        fn advance_fragment(&self, _: &str) -> Result<(), DemuxError> {
            Ok(())
        }
    }

    #[test]
    fn seek_to_snaps_via_demuxer_format_and_transitions_to_restart() {
        let mut s = Stream::new(StreamId(0), PeriodId(0), TrackKind::Video);
        s.state = StreamState::Downloading;
        let format = SnappingFormat {
            snap_to: Duration::from_millis(6_500),
        };
        let snapped = s
            .seek_to(&format, SeekFlags { snap_before: true, ..Default::default() }, Duration::from_secs(7))
            .unwrap();
        assert_eq!(snapped, Duration::from_millis(6_500));
        assert_eq!(s.state, StreamState::Restart);
        assert!(s.current_fragment.is_none());
    }
}
