//! Seek/Flush Controller: interprets seek requests, clips them to the live
//! window, coordinates FLUSH_START/FLUSH_STOP propagation, and restarts
//! Streams at the new position (spec §4.8, §8 P3, scenarios 2-3).
//!
//! Lock discipline (spec §4.8 "Lock discipline"): `API_LOCK` is acquired
//! first and held for the whole algorithm, serialising concurrent seek
//! calls from the API context; `TRACKS_LOCK` (`presentation::TracksLock`)
//! is then taken and released per-step, matching the documented
//! `API_LOCK -> MANIFEST_LOCK -> TRACKS_LOCK` order (this controller never
//! touches manifest refresh bookkeeping directly, so no `MANIFEST_LOCK`
//! appears on its path).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::collaborators::{DemuxerFormat, DownstreamSlotSink, SeekFlags};
use crate::error::DemuxError;
use crate::period::{PeriodId, StreamId};
use crate::presentation::{Presentation, TracksLock};
use crate::track::{QueuedItem, QueuedItemPayload, StreamEvent, TrackKind};

/// Whether a seek specifies a time position or a byte/segment position;
/// only `Time` is supported (spec §4.8 step 1, "segment seeks are refused").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFormat {
    Time,
    Segment,
}

#[derive(Debug, Clone)]
pub struct SeekRequest {
    pub format: SeekFormat,
    pub flags: SeekFlags,
    pub position: Duration,
    pub stop: Option<Duration>,
    /// Signed instant-rate multiplier; only read when `flags.instant_rate_change`.
    pub rate: f64,
}

pub struct SeekController {
    tracks: Arc<TracksLock>,
    format: Arc<dyn DemuxerFormat>,
    downstream: Arc<dyn DownstreamSlotSink>,
    api_lock: Mutex<()>,
    next_seqnum: AtomicU64,
}

impl SeekController {
    pub fn new(
        tracks: Arc<TracksLock>,
        format: Arc<dyn DemuxerFormat>,
        downstream: Arc<dyn DownstreamSlotSink>,
    ) -> Self {
        Self {
            tracks,
            format,
            downstream,
            api_lock: Mutex::new(()),
            next_seqnum: AtomicU64::new(1),
        }
    }

    /// Run the spec §4.8 ten-step algorithm (numbered comments below match
    /// the spec's numbering). Returns the seqnum that threads through
    /// FLUSH_START, FLUSH_STOP, and SEGMENT on every active Slot.
    pub fn seek(&self, req: SeekRequest) -> Result<u64, DemuxError> {
        let _api_guard = self.api_lock.lock();

        // 1. Validate: only TIME-format, flushing seeks are supported;
        // instant-rate-change seeks skip steps 2-9.
        if req.format != SeekFormat::Time {
            return Err(DemuxError::SeekRejected {
                reason: "segment-format seeks are not supported".into(),
            });
        }
        if req.flags.instant_rate_change {
            return Ok(self.apply_instant_rate_change(req.rate));
        }
        if !req.flags.flush {
            return Err(DemuxError::SeekRejected {
                reason: "only flushing seeks are supported".into(),
            });
        }

        // 2. Live window clipping.
        let (start, stop) = self.clip_to_live_window(req.position, req.stop, req.flags)?;

        let seqnum = self.next_seqnum.fetch_add(1, Ordering::SeqCst);
        let backup = self.tracks.lock().demuxer_segment;

        let result = self.run_flushing_seek(seqnum, start, stop, req.flags);
        if result.is_err() {
            // "Seeks that fail after the segment backup is taken restore
            // the backup" (spec §7).
            self.tracks.lock().demuxer_segment = backup;
        }
        result.map(|_| seqnum)
    }

    /// Instant-rate-change seeks post a rate-change event and update
    /// `instant_rate_multiplier`, nothing else (spec §4.8 step 1). Per the
    /// spec §9 Open Question decision (see DESIGN.md), `qos_earliest_time`
    /// is left untouched here — only a flushing seek resets it.
    fn apply_instant_rate_change(&self, rate: f64) -> u64 {
        let seqnum = {
            let mut guard = self.tracks.lock();
            guard.demuxer_segment.instant_rate_multiplier = rate;
            guard.demuxer_segment.seek_seqnum
        };
        self.emit_to_all_slots(StreamEvent::RateChange { multiplier: rate });
        seqnum
    }

    /// Clip `position`/`stop` to the collaborator's live seek range.
    /// Exceeding the upper bound is refused outright (spec §8 scenario 3:
    /// "A seek to 200 s with end range is refused"); falling below the
    /// lower bound clips to it. ACCURATE retains the requested endpoint
    /// unclipped when it already falls inside the range.
    fn clip_to_live_window(
        &self,
        position: Duration,
        stop: Option<Duration>,
        flags: SeekFlags,
    ) -> Result<(Duration, Option<Duration>), DemuxError> {
        let Some((lo, hi)) = self.format.live_seek_range() else {
            return Ok((position, stop));
        };
        if position > hi {
            warn!(?position, ?hi, "seek position exceeds live seek range, refusing");
            return Err(DemuxError::SeekRejected {
                reason: format!("seek position {position:?} exceeds live range end {hi:?}"),
            });
        }
        let clipped_start = if flags.accurate && position >= lo {
            position
        } else {
            position.max(lo)
        };
        let clipped_stop = stop.map(|s| if flags.accurate { s } else { s.min(hi) });
        Ok((clipped_start, clipped_stop))
    }

    fn run_flushing_seek(
        &self,
        seqnum: u64,
        start: Duration,
        _stop: Option<Duration>,
        flags: SeekFlags,
    ) -> Result<(), DemuxError> {
        // 3. FLUSH_START to all slots with the seek seqnum.
        self.tracks.lock().flushing = true;
        self.emit_to_all_slots(StreamEvent::FlushStart { seqnum });

        // 4. Stop all period tasks. Manifest-update cadence is driven by
        // `ManifestUpdater`'s own loop, outside `Presentation`, so nothing
        // here needs to pause it.
        {
            let mut guard = self.tracks.lock();
            for stream in guard.streams_iter_mut() {
                stream.stop();
            }
        }

        // 5. Reset all tracks: flush, deactivate/reactivate sink.
        {
            let mut guard = self.tracks.lock();
            for track in guard.tracks_iter_mut() {
                let was_selected = track.selected;
                track.active = false;
                track.flush();
                track.active = was_selected;
            }
        }

        // 6. SNAP: pick a (random) active stream of the output period, or a
        // default one if none is active yet, and snap-seek on it; every
        // other stream then aligns to whatever position it resolves to
        // (spec §4.8 step 6, `gst_adaptive_demux_handle_seek_event`'s
        // `IS_SNAP_SEEK` branch).
        let mut position = start;
        if flags.snap_before || flags.snap_after {
            let snap_stream_id = {
                let guard = self.tracks.lock();
                guard
                    .output_period_id()
                    .and_then(|pid| pick_snap_stream(&guard, pid))
            };
            if let Some(stream_id) = snap_stream_id {
                let mut guard = self.tracks.lock();
                if let Some(stream) = guard.stream_mut(stream_id) {
                    position = stream.seek_to(self.format.as_ref(), flags, position).map_err(|e| {
                        warn!(error = %e, "snap seek failed, aborting");
                        e
                    })?;
                }
            }
        }

        // 7. Collaborator-specific demuxer seek.
        let final_position = self.format.seek(position, flags)?;
        {
            let mut guard = self.tracks.lock();
            guard.demuxer_segment.segment.start = final_position.as_nanos() as u64;
            guard.demuxer_segment.segment.position = final_position.as_nanos() as u64;
            guard.demuxer_segment.seek_seqnum = seqnum;
            // Flushing seeks reset qos_earliest_time; instant-rate-change
            // does not (spec §9 Open Question).
            guard.qos_earliest_time = None;
            // Any instant-rate override is undone by a completed flushing
            // seek (gstadaptivedemux.c ~2331: `demux->instant_rate_multiplier = 1.0`).
            guard.demuxer_segment.instant_rate_multiplier = 1.0;
        }

        // 8. Handle a period change that the seek crossed.
        self.advance_period_if_seek_crossed_one();

        // 9. FLUSH_STOP with the same seqnum.
        self.emit_to_all_slots(StreamEvent::FlushStop { seqnum });

        // 10. Restart streams at the new position.
        {
            let mut guard = self.tracks.lock();
            guard.flushing = false;
            for stream in guard.streams_iter_mut() {
                stream.restart_at(final_position);
                stream.restart_to_start_fragment();
            }
        }
        self.tracks.notify_tracks_added();

        info!(seqnum, position = ?final_position, "flushing seek complete");
        Ok(())
    }

    /// If the OutputPeriod has a successor already queued and the
    /// collaborator confirms the presentation has moved past it, mark the
    /// OutputPeriod's tracks EOS (so the OutputPump's own period-advance
    /// step picks it up) and drop any pending slot replacements, which
    /// would otherwise point at tracks about to be freed (spec §4.8 step 8).
    fn advance_period_if_seek_crossed_one(&self) {
        let mut guard = self.tracks.lock();
        let Some(output_id) = guard.output_period_id() else {
            return;
        };
        let has_next = guard
            .period(output_id)
            .map(|p| p.has_next_period)
            .unwrap_or(false);
        if !has_next || !self.format.has_next_period() {
            return;
        }
        let track_ids = guard
            .period(output_id)
            .map(|p| p.tracks.clone())
            .unwrap_or_default();
        for id in track_ids {
            if let Some(t) = guard.track_mut(id) {
                t.eos = true;
            }
        }
        for slot in guard.selector.slots.iter_mut() {
            slot.pending_track = None;
        }
        guard.selector.requested_selection_seqnum += 1;
    }

    fn emit_to_all_slots(&self, event: StreamEvent) {
        let kinds: Vec<TrackKind> = self
            .tracks
            .lock()
            .selector
            .slots
            .iter()
            .map(|s| s.kind)
            .collect();
        for kind in kinds {
            let item = QueuedItem {
                payload: QueuedItemPayload::Event(event.clone()),
                size_bytes: 0,
                rt_start: None,
                rt_end: None,
                rt_buffering: None,
            };
            let _ = self.downstream.push(kind, item);
        }
    }
}

/// Pick a stream to snap-seek on (spec §4.8 step 6): prefer one feeding a
/// currently selected track, falling back to one feeding a
/// select-by-default track; `None` if neither exists (the snap is skipped
/// entirely, matching the original's behaviour when `stream == NULL`).
fn pick_snap_stream(guard: &Presentation, period_id: PeriodId) -> Option<StreamId> {
    let period = guard.period(period_id)?;
    let mut default_stream = None;
    for &stream_id in &period.streams {
        let Some(stream) = guard.stream(stream_id) else {
            continue;
        };
        let is_selected = stream
            .tracks
            .iter()
            .any(|tid| guard.track(*tid).is_some_and(|t| t.selected));
        if is_selected {
            return Some(stream_id);
        }
        if default_stream.is_none() {
            let is_default = stream
                .tracks
                .iter()
                .any(|tid| guard.track(*tid).is_some_and(|t| t.select_by_default));
            if is_default {
                default_stream = Some(stream_id);
            }
        }
    }
    default_stream
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::OutputSlot;
    use crate::collaborators::{FlowStatus, FragmentUpdate, ManifestOutcome};
    use crate::error::DemuxError as Err_;
    use crate::track::TrackKind;
    use std::sync::Mutex as StdMutex;

    struct FakeFormat {
        live_range: Option<(Duration, Duration)>,
        has_next_period: bool,
    }

    impl DemuxerFormat for FakeFormat {
        fn process_manifest(&self, _: &[u8]) -> Result<ManifestOutcome, Err_> {
            unimplemented!()
        }
        fn update_manifest_data(&self, _: &[u8]) -> Result<ManifestOutcome, Err_> {
            unimplemented!()
        }
        fn duration(&self) -> Option<Duration> {
            None
        }
        fn is_live(&self) -> bool {
            self.live_range.is_some()
        }
        fn period_start_time(&self) -> Duration {
            Duration::ZERO
        }
        fn has_next_period(&self) -> bool {
            self.has_next_period
        }
        fn advance_period(&self) -> Result<(), Err_> {
            Ok(())
        }
        fn manifest_update_interval(&self) -> Duration {
            Duration::from_secs(6)
        }
        fn requires_periodical_playlist_update(&self) -> bool {
            false
        }
        fn live_seek_range(&self) -> Option<(Duration, Duration)> {
            self.live_range
        }
        fn seek(&self, position: Duration, _flags: SeekFlags) -> Result<Duration, Err_> {
            Ok(position)
        }
    }

    /// Snaps every seek to a fixed position and counts calls, so a test can
    /// tell whether the per-stream snap call in step 6 actually ran (it adds
    /// one extra `seek()` call beyond step 7's collaborator seek).
    struct SnappingFakeFormat {
        snap_to: Duration,
        calls: std::sync::atomic::AtomicU64,
    }

    impl DemuxerFormat for SnappingFakeFormat {
        fn process_manifest(&self, _: &[u8]) -> Result<ManifestOutcome, Err_> {
            unimplemented!()
        }
        fn update_manifest_data(&self, _: &[u8]) -> Result<ManifestOutcome, Err_> {
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
        fn advance_period(&self) -> Result<(), Err_> {
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
        fn seek(&self, _position: Duration, _flags: SeekFlags) -> Result<Duration, Err_> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.snap_to)
        }
        fn update_fragment_info(&self, _: &str) -> Result<FragmentUpdate, Err_> {
            Ok(FragmentUpdate::Eos)
        }
        fn has_next_fragment(&self, _: &str) -> bool {
            false
        }
        fn advance_fragment(&self, _: &str) -> Result<(), Err_> {
            Ok(())
        }
    }
        fn update_fragment_info(&self, _: &str) -> Result<FragmentUpdate, Err_> {
            Ok(FragmentUpdate::Eos)
        }
        fn has_next_fragment(&self, _: &str) -> bool {
            false
        }
        fn advance_fragment(&self, _: &str) -> Result<(), Err_> {
            Ok(())
        }
    }

    struct RecordingSink {
        pushed: StdMutex<Vec<(TrackKind, QueuedItemPayload)>>,
    }

    impl Default for RecordingSink {
        fn default() -> Self {
            Self {
                pushed: StdMutex::new(Vec::new()),
            }
        }
    }

    impl DownstreamSlotSink for RecordingSink {
        fn push(&self, kind: TrackKind, item: QueuedItem) -> FlowStatus {
            self.pushed.lock().unwrap().push((kind, item.payload));
            FlowStatus::Ok
        }
    }

    fn harness(live_range: Option<(Duration, Duration)>) -> (SeekController, Arc<TracksLock>, Arc<RecordingSink>) {
        let tracks = Arc::new(TracksLock::default());
        {
            let mut guard = tracks.lock();
            let period = guard.new_period();
            let track_id = guard.new_track(period, "v0", TrackKind::Video);
            guard.track_mut(track_id).unwrap().selected = true;
            guard
                .selector
                .slots
                .push(OutputSlot::new(crate::selector::SlotId(0), TrackKind::Video, track_id));
        }
        let format = Arc::new(FakeFormat {
            live_range,
            has_next_period: false,
        });
        let sink = Arc::new(RecordingSink::default());
        let controller = SeekController::new(tracks.clone(), format, sink.clone());
        (controller, tracks, sink)
    }

    #[test]
    fn segment_format_seeks_are_refused() {
        let (controller, _tracks, _sink) = harness(None);
        let result = controller.seek(SeekRequest {
            format: SeekFormat::Segment,
            flags: SeekFlags {
                flush: true,
                ..Default::default()
            },
            position: Duration::from_secs(1),
            stop: None,
            rate: 1.0,
        });
        assert!(matches!(result, Err(DemuxError::SeekRejected { .. })));
    }

    #[test]
    fn non_flushing_seeks_are_refused() {
        let (controller, _tracks, _sink) = harness(None);
        let result = controller.seek(SeekRequest {
            format: SeekFormat::Time,
            flags: SeekFlags::default(),
            position: Duration::from_secs(1),
            stop: None,
            rate: 1.0,
        });
        assert!(matches!(result, Err(DemuxError::SeekRejected { .. })));
    }

    #[test]
    fn flushing_seek_brackets_flush_start_and_stop_with_same_seqnum() {
        let (controller, tracks, sink) = harness(None);
        let seqnum = controller
            .seek(SeekRequest {
                format: SeekFormat::Time,
                flags: SeekFlags {
                    flush: true,
                    ..Default::default()
                },
                position: Duration::from_secs(7),
                stop: None,
                rate: 1.0,
            })
            .unwrap();

        let pushed = sink.pushed.lock().unwrap();
        let seqnums: Vec<u64> = pushed
            .iter()
            .filter_map(|(_, p)| match p {
                QueuedItemPayload::Event(StreamEvent::FlushStart { seqnum }) => Some(*seqnum),
                QueuedItemPayload::Event(StreamEvent::FlushStop { seqnum }) => Some(*seqnum),
                _ => None,
            })
            .collect();
        assert_eq!(seqnums, vec![seqnum, seqnum]);
        assert!(!tracks.lock().flushing);
        assert_eq!(tracks.lock().demuxer_segment.seek_seqnum, seqnum);
    }

    #[test]
    fn live_seek_clips_below_range_start() {
        let (controller, tracks, _sink) = harness(Some((Duration::from_secs(100), Duration::from_secs(130))));
        controller
            .seek(SeekRequest {
                format: SeekFormat::Time,
                flags: SeekFlags {
                    flush: true,
                    ..Default::default()
                },
                position: Duration::from_secs(40),
                stop: None,
                rate: 1.0,
            })
            .unwrap();
        let committed = tracks.lock().demuxer_segment.segment.start;
        assert_eq!(committed, Duration::from_secs(100).as_nanos() as u64);
    }

    #[test]
    fn live_seek_past_range_end_is_refused_with_no_state_change() {
        let (controller, tracks, _sink) = harness(Some((Duration::from_secs(100), Duration::from_secs(130))));
        let before = tracks.lock().demuxer_segment;
        let result = controller.seek(SeekRequest {
            format: SeekFormat::Time,
            flags: SeekFlags {
                flush: true,
                ..Default::default()
            },
            position: Duration::from_secs(200),
            stop: None,
            rate: 1.0,
        });
        assert!(matches!(result, Err(DemuxError::SeekRejected { .. })));
        assert_eq!(tracks.lock().demuxer_segment, before);
    }

    #[test]
    fn instant_rate_change_skips_flush_and_updates_multiplier() {
        let (controller, tracks, sink) = harness(None);
        controller
            .seek(SeekRequest {
                format: SeekFormat::Time,
                flags: SeekFlags {
                    instant_rate_change: true,
                    ..Default::default()
                },
                position: Duration::ZERO,
                stop: None,
                rate: 2.0,
            })
            .unwrap();
        assert_eq!(tracks.lock().demuxer_segment.instant_rate_multiplier, 2.0);
        let pushed = sink.pushed.lock().unwrap();
        assert!(pushed
            .iter()
            .all(|(_, p)| !matches!(p, QueuedItemPayload::Event(StreamEvent::FlushStart { .. }))));
        assert!(pushed
            .iter()
            .any(|(_, p)| matches!(p, QueuedItemPayload::Event(StreamEvent::RateChange { multiplier }) if *multiplier == 2.0)));
    }

    #[test]
    fn snap_seek_resolves_via_selected_stream_before_collaborator_seek() {
        let tracks = Arc::new(TracksLock::default());
        {
            let mut guard = tracks.lock();
            let period = guard.new_period();
            let track_id = guard.new_track(period, "v0", TrackKind::Video);
            guard.track_mut(track_id).unwrap().selected = true;
            guard
                .selector
                .slots
                .push(OutputSlot::new(crate::selector::SlotId(0), TrackKind::Video, track_id));
            let stream_id = guard.new_stream(period, TrackKind::Video);
            guard.stream_mut(stream_id).unwrap().tracks.push(track_id);
        }
        let format = Arc::new(SnappingFakeFormat {
            snap_to: Duration::from_millis(6_500),
            calls: std::sync::atomic::AtomicU64::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let controller = SeekController::new(tracks.clone(), format.clone(), sink);

        controller
            .seek(SeekRequest {
                format: SeekFormat::Time,
                flags: SeekFlags {
                    flush: true,
                    snap_before: true,
                    ..Default::default()
                },
                position: Duration::from_secs(7),
                stop: None,
                rate: 1.0,
            })
            .unwrap();

        // One call from the per-stream snap in step 6, one from the
        // collaborator seek in step 7.
        assert_eq!(format.calls.load(Ordering::SeqCst), 2);
        let committed = tracks.lock().demuxer_segment.segment.start;
        assert_eq!(committed, Duration::from_millis(6_500).as_nanos() as u64);
    }
}
