//! Presentation: the arena-owned graph of Periods, Streams, and Tracks,
//! plus the shared `TRACKS_LOCK` and `tracks_added` condition the Output
//! context and API context synchronise on (spec §3 "Presentation state",
//! §5, §9 arena+index redesign).
//!
//! `Stream`/`Track` store only an index (`PeriodId`) back into the period
//! arena, never an owning back-pointer, per spec §9's "replace cyclic
//! back-pointers with an index into the period arena".

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

use crate::clock::RunningTime;
use crate::period::{Period, PeriodId, StreamId};
use crate::selector::Selector;
use crate::stream::Stream;
use crate::track::{Segment, Track, TrackId, TrackKind};

/// Overall playback segment (spec §3 "DemuxerSegment").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemuxerSegment {
    pub segment: Segment,
    pub instant_rate_multiplier: f64,
    pub seek_seqnum: u64,
}

impl Default for DemuxerSegment {
    fn default() -> Self {
        Self {
            segment: Segment::default(),
            instant_rate_multiplier: 1.0,
            seek_seqnum: 0,
        }
    }
}

/// Simple append-only arena: indices are never reused within a session,
/// matching spec §9's "the periods queue is a natural arena; indices into
/// it are stable during a session".
#[derive(Default)]
struct Arena<T> {
    slots: Vec<Option<T>>,
}

impl<T> Arena<T> {
    fn insert(&mut self, value: T) -> usize {
        let id = self.slots.len();
        self.slots.push(Some(value));
        id
    }

    fn get(&self, id: usize) -> Option<&T> {
        self.slots.get(id).and_then(|s| s.as_ref())
    }

    fn get_mut(&mut self, id: usize) -> Option<&mut T> {
        self.slots.get_mut(id).and_then(|s| s.as_mut())
    }

    fn remove(&mut self, id: usize) -> Option<T> {
        self.slots.get_mut(id).and_then(|s| s.take())
    }

    fn iter(&self) -> impl Iterator<Item = &T> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }
}

pub struct Presentation {
    periods: Arena<Period>,
    streams: Arena<Stream>,
    tracks: Arena<Track>,

    /// Head is the OutputPeriod (being drained), tail is the InputPeriod
    /// (being filled) (spec §3, §4.4 invariant).
    period_order: VecDeque<PeriodId>,
    next_period_seq: u64,
    next_stream_id: u64,
    next_track_id: u64,

    pub selector: Selector,
    pub demuxer_segment: DemuxerSegment,

    pub have_manifest: bool,
    pub running: bool,
    pub flushing: bool,
    pub global_output_time: RunningTime,
    /// Reset only on flushing seeks, never on instant-rate-change seeks
    /// (spec §9 Open Question, decided in DESIGN.md).
    pub qos_earliest_time: RunningTime,
}

impl Default for Presentation {
    fn default() -> Self {
        Self::new()
    }
}

impl Presentation {
    pub fn new() -> Self {
        Self {
            periods: Arena::default(),
            streams: Arena::default(),
            tracks: Arena::default(),
            period_order: VecDeque::new(),
            next_period_seq: 0,
            next_stream_id: 0,
            next_track_id: 0,
            selector: Selector::new(),
            demuxer_segment: DemuxerSegment::default(),
            have_manifest: false,
            running: false,
            flushing: false,
            global_output_time: None,
            qos_earliest_time: None,
        }
    }

    pub fn new_period(&mut self) -> PeriodId {
        let seqnum = self.next_period_seq;
        self.next_period_seq += 1;
        let id = PeriodId(self.periods.insert(Period::new(PeriodId(0), seqnum)) as u64);
        // Patch in the real id now that we know the arena slot.
        if let Some(p) = self.periods.get_mut(id.0 as usize) {
            p.id = id;
        }
        if let Some(&prev) = self.period_order.back() {
            if let Some(prev_period) = self.periods.get_mut(prev.0 as usize) {
                prev_period.has_next_period = true;
            }
        }
        self.period_order.push_back(id);
        id
    }

    pub fn new_stream(&mut self, period_id: PeriodId, kind: TrackKind) -> StreamId {
        let stream_id = StreamId(self.next_stream_id);
        self.next_stream_id += 1;
        let idx = self.streams.insert(Stream::new(stream_id, period_id, kind));
        debug_assert_eq!(idx as u64, stream_id.0);
        if let Some(period) = self.periods.get_mut(period_id.0 as usize) {
            period.add_stream(stream_id, kind, false);
        }
        stream_id
    }

    pub fn new_track(
        &mut self,
        period_id: PeriodId,
        stream_id: &str,
        kind: TrackKind,
    ) -> TrackId {
        let track_id = TrackId(self.next_track_id);
        self.next_track_id += 1;
        let idx = self.tracks.insert(Track::new(track_id, stream_id, kind));
        debug_assert_eq!(idx as u64, track_id.0);
        if let Some(period) = self.periods.get_mut(period_id.0 as usize) {
            period.add_track(track_id);
        }
        track_id
    }

    pub fn period(&self, id: PeriodId) -> Option<&Period> {
        self.periods.get(id.0 as usize)
    }

    pub fn period_mut(&mut self, id: PeriodId) -> Option<&mut Period> {
        self.periods.get_mut(id.0 as usize)
    }

    pub fn stream(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(id.0 as usize)
    }

    pub fn stream_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(id.0 as usize)
    }

    pub fn streams_iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.iter_mut()
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(id.0 as usize)
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.get_mut(id.0 as usize)
    }

    pub fn tracks_iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn tracks_iter_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.iter_mut()
    }

    pub fn output_period_id(&self) -> Option<PeriodId> {
        self.period_order.front().copied()
    }

    pub fn input_period_id(&self) -> Option<PeriodId> {
        self.period_order.back().copied()
    }

    /// Pop the drained OutputPeriod and promote the next one, freeing the
    /// old period's arena slot and dereferencing its tracks/streams (spec
    /// §3 "Lifecycle", §4.6 step 5).
    /// Record that `stream_id` finished downloading a fragment, and — when
    /// it parks on `WaitingOutputSpace` — register its wakeup time on the
    /// owning Period so the OutputPump's `take_elapsed_wakeup` check can
    /// release it later (spec §4.3/§4.4 "Backpressure").
    pub fn stream_fragment_complete(
        &mut self,
        stream_id: StreamId,
        over_high_watermark: bool,
        next_wakeup: RunningTime,
    ) {
        let period_id = match self.stream_mut(stream_id) {
            Some(stream) => {
                stream.fragment_complete(over_high_watermark, next_wakeup);
                stream.period_id
            }
            None => return,
        };
        if over_high_watermark {
            if let Some(period) = self.period_mut(period_id) {
                period.set_next_wakeup(next_wakeup);
            }
        }
    }

    pub fn advance_period(&mut self) -> Option<PeriodId> {
        let old = self.period_order.pop_front()?;
        if let Some(period) = self.periods.remove(old.0 as usize) {
            for track_id in period.tracks {
                self.tracks.remove(track_id.0 as usize);
            }
            for stream_id in period.streams {
                self.streams.remove(stream_id.0 as usize);
            }
        }
        self.period_order.front().copied()
    }
}

/// The shared lock pair the spec calls `TRACKS_LOCK` plus its
/// `tracks_added` condition variable. Output context blocks on the
/// condvar; any mutator that adds data calls `notify_tracks_added` after
/// releasing (or while holding, since `parking_lot::Condvar::notify_all`
/// is safe to call under the lock) the lock.
pub struct TracksLock {
    state: Mutex<Presentation>,
    tracks_added: Condvar,
}

impl Default for TracksLock {
    fn default() -> Self {
        Self::new(Presentation::new())
    }
}

impl TracksLock {
    pub fn new(presentation: Presentation) -> Self {
        Self {
            state: Mutex::new(presentation),
            tracks_added: Condvar::new(),
        }
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Presentation> {
        self.state.lock()
    }

    pub fn notify_tracks_added(&self) {
        self.tracks_added.notify_all();
    }

    /// Block the calling thread until `tracks_added` is signalled or
    /// `timeout` elapses, whichever comes first. Used by the OutputPump's
    /// wait step (spec §4.6 step 4).
    pub fn wait_tracks_added(
        &self,
        guard: &mut parking_lot::MutexGuard<'_, Presentation>,
        timeout: std::time::Duration,
    ) {
        self.tracks_added.wait_for(guard, timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_period_marks_predecessor_has_next_period() {
        let mut p = Presentation::new();
        let first = p.new_period();
        assert!(!p.period(first).unwrap().has_next_period);
        let second = p.new_period();
        assert!(p.period(first).unwrap().has_next_period);
        assert_eq!(p.input_period_id(), Some(second));
        assert_eq!(p.output_period_id(), Some(first));
    }

    #[test]
    fn advance_period_frees_tracks_and_streams() {
        let mut p = Presentation::new();
        let period = p.new_period();
        let _next = p.new_period();
        let track = p.new_track(period, "v0", TrackKind::Video);
        assert!(p.track(track).is_some());
        p.advance_period();
        assert!(p.track(track).is_none());
    }

    #[test]
    fn stream_fragment_complete_registers_period_wakeup_over_watermark() {
        let mut p = Presentation::new();
        let period = p.new_period();
        let stream = p.new_stream(period, TrackKind::Video);
        p.stream_fragment_complete(stream, true, Some(123));
        assert_eq!(p.stream(stream).unwrap().next_input_wakeup_time, Some(123));
        assert!(!p.period_mut(period).unwrap().take_elapsed_wakeup(100));
        assert!(p.period_mut(period).unwrap().take_elapsed_wakeup(123));
    }

    #[test]
    fn stream_fragment_complete_under_watermark_does_not_register_wakeup() {
        let mut p = Presentation::new();
        let period = p.new_period();
        let stream = p.new_stream(period, TrackKind::Video);
        p.stream_fragment_complete(stream, false, None);
        assert!(!p.period_mut(period).unwrap().take_elapsed_wakeup(i64::MAX));
    }

    #[test]
    fn tracks_lock_wait_wakes_on_notify() {
        use std::sync::Arc;
        use std::time::Duration;

        let lock = Arc::new(TracksLock::default());
        let lock2 = lock.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            lock2.notify_tracks_added();
        });
        let mut guard = lock.lock();
        lock.wait_tracks_added(&mut guard, Duration::from_secs(5));
        handle.join().unwrap();
    }
}
