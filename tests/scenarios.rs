//! Integration tests exercising the scheduling core end to end: a
//! Presentation built directly through its public API, driven by an
//! `OutputPump` and a `SeekController`, observed through a recording
//! downstream sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use demux_core::collaborators::{
    DemuxerFormat, DownstreamSlotSink, FlowStatus, FragmentUpdate, ManifestOutcome, SeekFlags,
};
use demux_core::error::DemuxError;
use demux_core::output_pump::{OutputPump, PumpOutcome};
use demux_core::presentation::TracksLock;
use demux_core::seek::{SeekController, SeekFormat, SeekRequest};
use demux_core::selector::OutputSlot;
use demux_core::stream::FragmentInfo;
use demux_core::track::{QueuedItemPayload, Segment, StreamEvent, TrackKind};

struct RecordingSink {
    pushed: Mutex<Vec<(TrackKind, QueuedItemPayload)>>,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self {
            pushed: Mutex::new(Vec::new()),
        }
    }
}

impl DownstreamSlotSink for RecordingSink {
    fn push(&self, kind: TrackKind, item: demux_core::track::QueuedItem) -> FlowStatus {
        self.pushed.lock().unwrap().push((kind, item.payload));
        FlowStatus::Ok
    }
}

struct RecordingBus {
    notifications: Mutex<Vec<demux_core::bus::Notification>>,
}

impl Default for RecordingBus {
    fn default() -> Self {
        Self {
            notifications: Mutex::new(Vec::new()),
        }
    }
}

impl demux_core::bus::BusSink for RecordingBus {
    fn post(&self, notification: demux_core::bus::Notification) {
        self.notifications.lock().unwrap().push(notification);
    }
}

/// A `DemuxerFormat` stub whose seek just echoes the requested position and
/// whose live range/next-period flag are configurable per test.
struct StubFormat {
    live_range: Option<(Duration, Duration)>,
    has_next_period: bool,
}

impl StubFormat {
    fn vod() -> Self {
        Self {
            live_range: None,
            has_next_period: false,
        }
    }
}

impl DemuxerFormat for StubFormat {
    fn process_manifest(&self, _bytes: &[u8]) -> Result<ManifestOutcome, DemuxError> {
        unimplemented!("not exercised by these scenarios")
    }
    fn update_manifest_data(&self, _bytes: &[u8]) -> Result<ManifestOutcome, DemuxError> {
        unimplemented!("not exercised by these scenarios")
    }
    fn duration(&self) -> Option<Duration> {
        Some(Duration::from_secs(120))
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
    fn advance_period(&self) -> Result<(), DemuxError> {
        Ok(())
    }
    fn manifest_update_interval(&self) -> Duration {
        Duration::from_secs(6)
    }
    fn requires_periodical_playlist_update(&self) -> bool {
        self.live_range.is_some()
    }
    fn live_seek_range(&self) -> Option<(Duration, Duration)> {
        self.live_range
    }
    fn seek(&self, position: Duration, _flags: SeekFlags) -> Result<Duration, DemuxError> {
        Ok(position)
    }
    fn update_fragment_info(&self, _stream_id: &str) -> Result<FragmentUpdate, DemuxError> {
        Ok(FragmentUpdate::Ok(FragmentInfo {
            stream_time: Duration::ZERO,
            duration: Duration::from_secs(6),
            uri: "https://example.invalid/seg.ts".into(),
            byte_range: None,
            header_uri: None,
            index_uri: None,
            chunk_size: None,
        }))
    }
    fn has_next_fragment(&self, _stream_id: &str) -> bool {
        false
    }
    fn advance_fragment(&self, _stream_id: &str) -> Result<(), DemuxError> {
        Ok(())
    }
}

fn forward_segment() -> Segment {
    Segment {
        forward: true,
        rate_abs: 1.0,
        start: 0,
        stop: None,
        position: 0,
        base: 0,
        seqnum: 0,
    }
}

mod single_period_vod {
    use super::*;

    /// One period, one video track with queued data: the pump drains it and
    /// pushes sticky stream-start before the buffer, then EOS.
    #[test]
    fn pump_drains_a_selected_track_in_order() {
        let tracks = Arc::new(TracksLock::default());
        let bus = Arc::new(RecordingBus::default());
        let sink = Arc::new(RecordingSink::default());
        let pump = Arc::new(OutputPump::new(tracks.clone(), bus, sink.clone()));

        let track_id = {
            let mut guard = tracks.lock();
            let period = guard.new_period();
            let track_id = guard.new_track(period, "v0", TrackKind::Video);
            let track = guard.track_mut(track_id).unwrap();
            track.selected = true;
            track.input_segment = forward_segment();
            track.queue_event(
                StreamEvent::StreamStart {
                    stream_id: "v0".into(),
                    group_id: 0,
                },
                false,
            );
            track.queue_data(Bytes::from_static(b"frame0"), 0, Some(Duration::from_millis(500)), false);
            track.queue_event(StreamEvent::Eos, false);
            guard.selector.requested_selection_seqnum += 1;
            track_id
        };

        // First step attaches the slot (CreateSlot) and services it.
        for _ in 0..4 {
            if pump.step() != PumpOutcome::Progressed {
                break;
            }
        }

        let pushed = sink.pushed.lock().unwrap();
        assert!(!pushed.is_empty());
        assert!(matches!(
            pushed[0].1,
            QueuedItemPayload::Event(StreamEvent::StreamStart { .. })
        ));
        assert!(pushed
            .iter()
            .any(|(_, p)| matches!(p, QueuedItemPayload::Buffer { .. })));
        assert!(pushed
            .iter()
            .any(|(_, p)| matches!(p, QueuedItemPayload::Event(StreamEvent::Eos))));

        let guard = tracks.lock();
        assert_eq!(guard.selector.slots[0].track, track_id);
    }
}

mod flushing_seek {
    use super::*;

    /// A flushing seek mid-playback brackets FLUSH_START/FLUSH_STOP with the
    /// same seqnum and leaves the presentation's segment updated.
    #[test]
    fn seek_brackets_flush_events_and_updates_segment() {
        let tracks = Arc::new(TracksLock::default());
        {
            let mut guard = tracks.lock();
            let period = guard.new_period();
            let track_id = guard.new_track(period, "v0", TrackKind::Video);
            guard.track_mut(track_id).unwrap().selected = true;
            let slot_id = guard.selector.alloc_slot_id();
            guard
                .selector
                .slots
                .push(OutputSlot::new(slot_id, TrackKind::Video, track_id));
        }
        let format = Arc::new(StubFormat::vod());
        let sink = Arc::new(RecordingSink::default());
        let controller = SeekController::new(tracks.clone(), format, sink.clone());

        let seqnum = controller
            .seek(SeekRequest {
                format: SeekFormat::Time,
                flags: SeekFlags {
                    flush: true,
                    ..Default::default()
                },
                position: Duration::from_secs(30),
                stop: None,
                rate: 1.0,
            })
            .expect("flushing seek should succeed on VOD content");

        let pushed = sink.pushed.lock().unwrap();
        let bracket: Vec<_> = pushed
            .iter()
            .filter_map(|(_, p)| match p {
                QueuedItemPayload::Event(StreamEvent::FlushStart { seqnum }) => {
                    Some(("start", *seqnum))
                }
                QueuedItemPayload::Event(StreamEvent::FlushStop { seqnum }) => {
                    Some(("stop", *seqnum))
                }
                _ => None,
            })
            .collect();
        assert_eq!(bracket, vec![("start", seqnum), ("stop", seqnum)]);

        let guard = tracks.lock();
        assert!(!guard.flushing);
        assert_eq!(guard.demuxer_segment.seek_seqnum, seqnum);
        assert_eq!(
            guard.demuxer_segment.segment.start,
            Duration::from_secs(30).as_nanos() as u64
        );
    }

    /// An instant-rate-change seek posts a rate-change event with no flush
    /// bracket and leaves the current seqnum untouched.
    #[test]
    fn instant_rate_change_has_no_flush_bracket() {
        let tracks = Arc::new(TracksLock::default());
        let format = Arc::new(StubFormat::vod());
        let sink = Arc::new(RecordingSink::default());
        let controller = SeekController::new(tracks.clone(), format, sink.clone());

        controller
            .seek(SeekRequest {
                format: SeekFormat::Time,
                flags: SeekFlags {
                    instant_rate_change: true,
                    ..Default::default()
                },
                position: Duration::ZERO,
                stop: None,
                rate: 1.5,
            })
            .unwrap();

        assert_eq!(tracks.lock().demuxer_segment.instant_rate_multiplier, 1.5);
        let pushed = sink.pushed.lock().unwrap();
        assert!(pushed
            .iter()
            .all(|(_, p)| !matches!(p, QueuedItemPayload::Event(StreamEvent::FlushStart { .. }))));
    }
}

mod live_window_clipping {
    use super::*;

    /// Seeking below the live window's start clips to it (spec scenario:
    /// seek to 40s with live range [100, 130] clips to 100).
    #[test]
    fn seek_below_live_start_clips_to_range_start() {
        let tracks = Arc::new(TracksLock::default());
        let format = Arc::new(StubFormat {
            live_range: Some((Duration::from_secs(100), Duration::from_secs(130))),
            has_next_period: false,
        });
        let sink = Arc::new(RecordingSink::default());
        let controller = SeekController::new(tracks.clone(), format, sink);

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

        assert_eq!(
            tracks.lock().demuxer_segment.segment.start,
            Duration::from_secs(100).as_nanos() as u64
        );
    }

    /// Seeking past the live window's end is refused outright with no
    /// state change (spec scenario: seek to 200s is refused).
    #[test]
    fn seek_past_live_end_is_refused() {
        let tracks = Arc::new(TracksLock::default());
        let format = Arc::new(StubFormat {
            live_range: Some((Duration::from_secs(100), Duration::from_secs(130))),
            has_next_period: false,
        });
        let sink = Arc::new(RecordingSink::default());
        let controller = SeekController::new(tracks.clone(), format, sink);
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
}

mod track_replacement {
    use super::*;

    /// Reconciling a new desired track of the same Kind attaches it as a
    /// pending replacement; once it has buffered past its watermark the
    /// pump switches the slot over to it.
    #[test]
    fn pending_replacement_switches_once_buffered_past_threshold() {
        let tracks = Arc::new(TracksLock::default());
        let bus = Arc::new(RecordingBus::default());
        let sink = Arc::new(RecordingSink::default());
        let pump = Arc::new(OutputPump::new(tracks.clone(), bus, sink.clone()));

        let (low, high) = {
            let mut guard = tracks.lock();
            let period = guard.new_period();
            let low = guard.new_track(period, "v-low", TrackKind::Video);
            let high = guard.new_track(period, "v-high", TrackKind::Video);

            let low_track = guard.track_mut(low).unwrap();
            low_track.selected = true;
            low_track.input_segment = forward_segment();
            low_track.queue_data(Bytes::from_static(b"lo"), 0, Some(Duration::from_secs(1)), false);
            guard.selector.requested_selection_seqnum += 1;
            (low, high)
        };

        // First pass: creates the slot for `low` and services it.
        pump.step();

        {
            let mut guard = tracks.lock();
            guard.track_mut(low).unwrap().selected = false;
            let high_track = guard.track_mut(high).unwrap();
            high_track.selected = true;
            high_track.buffering_threshold = Duration::from_millis(500);
            high_track.level_time = Duration::from_secs(1);
            guard.selector.requested_selection_seqnum += 1;
        }

        // Reconcile attaches `high` as pending; switch happens once ready,
        // within this single step.
        pump.step();

        let guard = tracks.lock();
        assert_eq!(guard.selector.slots.len(), 1);
        assert_eq!(guard.selector.slots[0].track, high);
        assert!(guard.track(low).unwrap().draining);
    }
}

mod period_advance {
    use super::*;

    /// Once every track in the OutputPeriod is drained and a successor
    /// period exists, the pump advances and posts a StreamCollection
    /// notification for the new period.
    #[test]
    fn pump_advances_to_next_period_once_drained() {
        let tracks = Arc::new(TracksLock::default());
        let bus = Arc::new(RecordingBus::default());
        let sink = Arc::new(RecordingSink::default());
        let pump = Arc::new(OutputPump::new(tracks.clone(), bus, sink.clone()));

        {
            let mut guard = tracks.lock();
            let first = guard.new_period();
            let _second = guard.new_period(); // marks `first.has_next_period`
            let track_id = guard.new_track(first, "v0", TrackKind::Video);
            let track = guard.track_mut(track_id).unwrap();
            track.selected = true;
            track.active = true;
            track.eos = true; // already drained
            let slot_id = guard.selector.alloc_slot_id();
            guard
                .selector
                .slots
                .push(OutputSlot::new(slot_id, TrackKind::Video, track_id));
            guard.selector.current_selection_seqnum = guard.selector.requested_selection_seqnum;
        }

        let outcome = pump.step();
        assert_eq!(outcome, PumpOutcome::Progressed);

        let guard = tracks.lock();
        assert_eq!(guard.period(guard.output_period_id().unwrap()).unwrap().seqnum, 1);
    }
}

mod retry_and_failure {
    use super::*;
    use demux_core::retry::{retry_with_backoff, RetryAction, RetryPolicy};
    use demux_core::stream::Stream;
    use demux_core::period::{PeriodId, StreamId};
    use tokio_util::sync::CancellationToken;

    /// Three consecutive transient fragment-download failures exhaust the
    /// policy's retry budget and surface as a non-retryable failure.
    #[tokio::test]
    async fn retry_with_backoff_gives_up_after_policy_exhausted() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: false,
        };
        let token = CancellationToken::new();
        let attempts = AtomicU64::new(0);
        let result: Result<(), DemuxError> = retry_with_backoff(&policy, &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(DemuxError::fragment_download(7, "timeout", true)) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    /// A Stream that exhausts its own per-fragment error budget transitions
    /// to Errored independent of the retry helper's own internal retries.
    #[test]
    fn stream_becomes_errored_after_max_consecutive_failures() {
        let mut stream = Stream::new(StreamId(0), PeriodId(0), TrackKind::Video);
        stream.start();
        assert!(!stream.record_error());
        assert!(!stream.record_error());
        assert!(stream.record_error());
        assert_eq!(stream.state, demux_core::stream::StreamState::Errored);
    }
}
