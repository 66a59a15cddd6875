//! Track: a bounded FIFO of timed items for one selectable elementary
//! stream, plus running-time bookkeeping and buffering-level computation
//! (spec §3, §4.2, §8 P1/P2/P8).
//!
//! Track methods assume `TRACKS_LOCK` is already held by the caller (spec
//! §4.2, §5) — they do no locking of their own. The shared lock and the
//! `tracks_added` condition variable live on `Presentation`
//! (`presentation.rs`); a `Track` method that would need to wake a waiter
//! returns a signal (`true`/a notify reason) instead of notifying directly,
//! so `Track` stays a plain, independently testable data type.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;

use crate::clock::RunningTime;

/// 100ms gap-drip slice size (spec §4.2, §8 P8).
pub const GAP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Video,
    Audio,
    Text,
}

/// A segment transform: maps stream time to running time, honouring
/// playback direction (spec §3 "Running-time bookkeeping").
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    /// `true` for forward playback, `false` for reverse.
    pub forward: bool,
    /// Absolute value of the playback rate; always > 0.
    pub rate_abs: f64,
    pub start: u64,
    pub stop: Option<u64>,
    pub position: u64,
    /// Running time corresponding to `start` (forward) or `stop` (reverse).
    pub base: i64,
    pub seqnum: u64,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            forward: true,
            rate_abs: 1.0,
            start: 0,
            stop: None,
            position: 0,
            base: 0,
            seqnum: 0,
        }
    }
}

impl Segment {
    /// Convert a stream time to a running time under this segment. Returns
    /// `None` for stream times outside the segment's covered range
    /// (pre-segment in forward playback, post-segment in reverse).
    pub fn to_running_time(&self, stream_time: u64) -> RunningTime {
        if self.forward {
            if stream_time < self.start {
                return None;
            }
            if let Some(stop) = self.stop {
                if stream_time > stop {
                    return None;
                }
            }
            let offset = (stream_time - self.start) as f64 / self.rate_abs;
            Some(self.base.saturating_add(offset as i64))
        } else {
            let stop = self.stop.unwrap_or(u64::MAX);
            if stream_time > stop || stream_time < self.start {
                return None;
            }
            let offset = (stop - stream_time) as f64 / self.rate_abs;
            Some(self.base.saturating_add(offset as i64))
        }
    }
}

/// Event vocabulary the core inspects (spec §9, replacing the surrounding
/// framework's own event types). Carries only the fields the core reads.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    StreamStart { stream_id: String, group_id: u64 },
    Caps { caps_id: u64 },
    Segment(Segment),
    Tag { tags: Vec<(String, String)> },
    Gap { position: RunningTime, duration: Duration },
    CustomSticky { name: String },
    Eos,
    FlushStart { seqnum: u64 },
    FlushStop { seqnum: u64 },
    /// Instant-rate-change seeks post this instead of a flush/segment pair
    /// (spec §4.8 step 1, §9 Open Question: never resets `qos_earliest_time`).
    RateChange { multiplier: f64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferFlags {
    pub discont: bool,
}

#[derive(Debug, Clone)]
pub enum QueuedItemPayload {
    Buffer { data: Bytes, flags: BufferFlags },
    Event(StreamEvent),
    Gap { position: RunningTime, duration: Duration },
}

#[derive(Debug, Clone)]
pub struct QueuedItem {
    pub payload: QueuedItemPayload,
    pub size_bytes: usize,
    pub rt_start: RunningTime,
    pub rt_end: RunningTime,
    pub rt_buffering: RunningTime,
}

impl QueuedItem {
    /// A bare EOS item, used by the OutputPump's failure path to signal
    /// every slot when downstream goes unhealthy (spec §4.6 "Failure").
    pub fn eos_for_pump() -> Self {
        Self {
            payload: QueuedItemPayload::Event(StreamEvent::Eos),
            size_bytes: 0,
            rt_start: None,
            rt_end: None,
            rt_buffering: None,
        }
    }
}

/// A gap-drip cursor: the remaining portion of a Gap event not yet handed
/// out in 100ms slices (spec §4.2, §8 P8).
#[derive(Debug, Clone, Copy)]
struct GapCursor {
    position: RunningTime,
    remaining: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackId(pub u64);

pub struct Track {
    pub id: TrackId,
    pub stream_id: String,
    pub kind: TrackKind,
    pub select_by_default: bool,

    pub selected: bool,
    pub active: bool,
    pub draining: bool,
    pub eos: bool,
    /// Suppresses an incoming EOS while a replacement track is pending on
    /// the slot this track feeds (spec §4.2 `queue_event`).
    pub eos_suppressed: bool,

    pub input_segment: Segment,
    pub output_segment: Segment,

    queue: VecDeque<QueuedItem>,
    pub events: crate::event_store::EventStore,

    pub input_time: RunningTime,
    pub lowest_input_time: RunningTime,
    pub output_time: RunningTime,
    pub level_time: Duration,
    pub level_bytes: usize,

    gap_cursor: Option<GapCursor>,
    pub output_discont: bool,

    /// Set when this track has just become the active occupant of an
    /// output slot (initial `CreateSlot`, or a replacement hand-off in
    /// `switch_ready_replacements`): the next Segment this track emits has
    /// its base running time rewritten to `global_output_position` rather
    /// than the position it was authored against (spec §4.7,
    /// `update_next_segment` in `gstadaptivedemux.c`).
    pub override_next_segment: bool,

    /// Track-level watermark used by the Selector when deciding a
    /// replacement switch is "ready" (spec §4.7, scenario 4).
    pub buffering_threshold: Duration,
}

impl Track {
    pub fn new(id: TrackId, stream_id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            id,
            stream_id: stream_id.into(),
            kind,
            select_by_default: false,
            selected: false,
            active: false,
            draining: false,
            eos: false,
            eos_suppressed: false,
            input_segment: Segment::default(),
            output_segment: Segment::default(),
            queue: VecDeque::new(),
            events: crate::event_store::EventStore::new(),
            input_time: None,
            lowest_input_time: None,
            output_time: None,
            level_time: Duration::ZERO,
            level_bytes: 0,
            gap_cursor: None,
            output_discont: false,
            override_next_segment: false,
            buffering_threshold: Duration::ZERO,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty() && self.gap_cursor.is_none() && self.events.get_next_pending().is_none()
    }

    /// Queue a parsed buffer. `stream_time`/`duration` are in the Parser's
    /// stream-time domain and are converted to running times via
    /// `input_segment`. Returns `true` if a waiter on `tracks_added` should
    /// be woken (the track transitioned from empty to non-empty).
    pub fn queue_data(
        &mut self,
        data: Bytes,
        stream_time: u64,
        duration: Option<Duration>,
        is_discont: bool,
    ) -> bool {
        let was_empty = self.is_empty();
        let rt_start = self.input_segment.to_running_time(stream_time);
        let end_stream_time = duration.map(|d| stream_time + d.as_nanos() as u64);
        let rt_end = end_stream_time.and_then(|t| self.input_segment.to_running_time(t));
        let size_bytes = data.len();

        self.bump_input_time(rt_start, rt_end, is_discont);

        self.queue.push_back(QueuedItem {
            payload: QueuedItemPayload::Buffer {
                data,
                flags: BufferFlags { discont: is_discont },
            },
            size_bytes,
            rt_start,
            rt_end,
            rt_buffering: self.input_time,
        });
        self.level_bytes += size_bytes;

        was_empty
    }

    /// Mirrors `track_queue_data_locked`'s running-time bookkeeping
    /// (`gstadaptivedemux-track.c`): `lowest_input_time` lazily seeds from
    /// `input_time` on the first sample, then forward playback only ever
    /// advances `input_time` while reverse playback tracks `lowest_input_time`
    /// — except on a DISCONT, where the two swap: the previous
    /// `lowest_input_time` becomes the new `input_time` and the incoming
    /// sample reseeds `lowest_input_time`.
    fn bump_input_time(&mut self, rt_start: RunningTime, rt_end: RunningTime, is_discont: bool) {
        if self.lowest_input_time.is_none() {
            self.lowest_input_time = Some(self.input_time.unwrap_or(0));
        }

        if self.input_segment.forward {
            if let Some(end) = rt_end.or(rt_start) {
                self.input_time = Some(self.input_time.map_or(end, |cur| cur.max(end)));
            }
        } else if let Some(start) = rt_start.or(rt_end) {
            if is_discont {
                self.input_time = self.lowest_input_time;
                self.lowest_input_time = Some(start);
            } else if start < self.lowest_input_time.unwrap() {
                self.lowest_input_time = Some(start);
            }
        }
    }

    /// Queue an event. Segment events update `input_segment` and act as a
    /// discontinuity marker. Stream-start/stream-collection from upstream
    /// are never stored by `Track` itself (the core emits its own, at the
    /// Selector layer) — callers should not pass them here. EOS is dropped
    /// while a replacement is pending; a previously queued EOS is removed
    /// before a fresh Stream-Start (the caller passes `replacing_stream_start
    /// = true` for that case).
    pub fn queue_event(&mut self, event: StreamEvent, replacing_stream_start: bool) -> bool {
        let was_empty = self.is_empty();

        if matches!(event, StreamEvent::Eos) && self.eos_suppressed {
            return false;
        }

        if replacing_stream_start {
            while matches!(
                self.queue.back().map(|i| &i.payload),
                Some(QueuedItemPayload::Event(StreamEvent::Eos))
            ) {
                self.queue.pop_back();
            }
        }

        if let StreamEvent::Segment(seg) = &event {
            self.input_segment = *seg;
            self.output_discont = true;
        }
        if matches!(event, StreamEvent::Eos) {
            self.eos = true;
        }

        let stored_sticky = self.events.store(event.clone());
        if stored_sticky {
            // Sticky events are delivered through `dequeue`'s priority path,
            // not placed on the plain queue; only non-sticky events (Eos,
            // FlushStart/Stop) are queued directly.
            return was_empty;
        }

        self.queue.push_back(QueuedItem {
            payload: QueuedItemPayload::Event(event),
            size_bytes: 0,
            rt_start: self.input_segment.to_running_time(self.input_segment.position),
            rt_end: None,
            rt_buffering: self.input_time,
        });

        was_empty
    }

    /// Queue a Gap of `duration` at running-time `position` (spec §3, §8 P8).
    pub fn queue_gap(&mut self, position: RunningTime, duration: Duration) -> bool {
        let was_empty = self.is_empty();
        self.queue.push_back(QueuedItem {
            payload: QueuedItemPayload::Gap { position, duration },
            size_bytes: 0,
            rt_start: position,
            rt_end: position.map(|p| p.saturating_add(duration.as_nanos() as i64)),
            rt_buffering: self.input_time,
        });
        was_empty
    }

    /// Dequeue the next item per spec §4.2 priority: pending sticky event,
    /// then a gap-drip slice, then the queue head (converting a head Gap
    /// that overlaps the output segment into a drip cursor first).
    ///
    /// `global_output` is consulted only when `override_next_segment` is
    /// set: the outgoing Segment's base running time is then rewritten to
    /// it before delivery (spec §4.7, `update_next_segment`).
    pub fn dequeue(&mut self, check_sticky: bool, global_output: RunningTime) -> Option<QueuedItem> {
        if check_sticky {
            if let Some(event) = self.events.get_next_pending().cloned() {
                self.events.mark_delivered(&event);
                let event = if let StreamEvent::Segment(mut seg) = event {
                    if self.override_next_segment {
                        if let Some(go) = global_output {
                            seg.base = go;
                        }
                        self.override_next_segment = false;
                    }
                    self.output_segment = seg;
                    StreamEvent::Segment(seg)
                } else {
                    event
                };
                return Some(QueuedItem {
                    payload: QueuedItemPayload::Event(event),
                    size_bytes: 0,
                    rt_start: None,
                    rt_end: None,
                    rt_buffering: self.input_time,
                });
            }
        }

        if let Some(cursor) = self.gap_cursor {
            return Some(self.take_gap_slice(cursor));
        }

        match self.queue.front().map(|i| &i.payload) {
            Some(QueuedItemPayload::Gap { position, duration }) => {
                // A Gap at the queue head always overlaps the output
                // segment in practice: the output segment only ever trails
                // or matches the input segment that produced the gap.
                let position = *position;
                let duration = *duration;
                self.queue.pop_front();
                self.gap_cursor = Some(GapCursor {
                    position,
                    remaining: duration,
                });
                Some(self.take_gap_slice(self.gap_cursor.unwrap()))
            }
            Some(_) => {
                let item = self.queue.pop_front();
                if let Some(item) = &item {
                    self.level_bytes = self.level_bytes.saturating_sub(item.size_bytes);
                }
                item
            }
            None => None,
        }
    }

    fn take_gap_slice(&mut self, cursor: GapCursor) -> QueuedItem {
        let slice = cursor.remaining.min(GAP_SLICE);
        let remaining_after = cursor.remaining.saturating_sub(slice);
        self.gap_cursor = if remaining_after.is_zero() {
            None
        } else {
            Some(GapCursor {
                position: cursor.position.map(|p| running_time_add_dur(p, slice)),
                remaining: remaining_after,
            })
        };
        QueuedItem {
            payload: QueuedItemPayload::Gap {
                position: cursor.position,
                duration: slice,
            },
            size_bytes: 0,
            rt_start: cursor.position,
            rt_end: cursor.position.map(|p| running_time_add_dur(p, slice)),
            rt_buffering: self.input_time,
        }
    }

    /// Reset to the post-flush state (spec §3 I5, §4.2 `flush`).
    pub fn flush(&mut self) {
        self.queue.clear();
        self.input_segment = Segment::default();
        self.output_segment = Segment::default();
        self.level_time = Duration::ZERO;
        self.level_bytes = 0;
        self.input_time = None;
        self.lowest_input_time = None;
        self.output_time = None;
        self.eos = false;
        self.gap_cursor = None;
        self.output_discont = false;
    }

    /// Discard items whose `rt_end < rt`; sets `output_discont` when a
    /// Buffer is discarded (spec §4.2 `drain_to`). Gap cursors are
    /// partially consumed rather than discarded wholesale.
    pub fn drain_to(&mut self, rt: i64) {
        while let Some(item) = self.queue.front() {
            match item.rt_end {
                Some(end) if end < rt => {
                    let discarded = self.queue.pop_front().unwrap();
                    self.level_bytes = self.level_bytes.saturating_sub(discarded.size_bytes);
                    if matches!(discarded.payload, QueuedItemPayload::Buffer { .. }) {
                        self.output_discont = true;
                    }
                }
                _ => break,
            }
        }
        if let Some(cursor) = self.gap_cursor {
            if let Some(pos) = cursor.position {
                if pos < rt {
                    let consumed = Duration::from_nanos((rt - pos).max(0) as u64);
                    let remaining = cursor.remaining.saturating_sub(consumed);
                    self.gap_cursor = if remaining.is_zero() {
                        None
                    } else {
                        Some(GapCursor {
                            position: Some(rt),
                            remaining,
                        })
                    };
                }
            }
        }
    }

    /// Recompute `level_time` per invariant (I2)/(P2):
    /// `level_time = max(0, input_time - max(output_time, global_output))`.
    pub fn update_level(&mut self, global_output: RunningTime) {
        let effective_output = match (self.output_time, global_output) {
            (Some(o), Some(g)) => Some(o.max(g)),
            (Some(o), None) => Some(o),
            (None, Some(g)) => Some(g),
            (None, None) => None,
        };
        let input = self
            .input_time
            .or(self.lowest_input_time)
            .unwrap_or(0);
        self.level_time = match effective_output {
            Some(out) if input > out => Duration::from_nanos((input - out) as u64),
            Some(_) => Duration::ZERO,
            None => Duration::ZERO,
        };
    }

    /// Advance `output_time` past the given running time, used by the
    /// OutputPump after pushing an item downstream.
    pub fn update_next_position(&mut self, rt: RunningTime) {
        if let Some(rt) = rt {
            self.output_time = Some(self.output_time.map_or(rt, |cur| cur.max(rt)));
        }
    }
}

fn running_time_add_dur(rt: i64, d: Duration) -> i64 {
    rt.saturating_add(d.as_nanos().min(i64::MAX as u128) as i64)
}
