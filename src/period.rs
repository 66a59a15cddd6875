//! Period: one presentation interval owning Streams and the Tracks they
//! feed (spec §3, §4.4).

use crate::collaborators::FlowStatus;
use crate::track::{TrackId, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeriodId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u64);

/// A snapshot of the streams currently known in a Period, posted to the
/// bus on change (spec §3 "StreamCollection snapshot").
#[derive(Debug, Clone)]
pub struct StreamCollection {
    pub streams: Vec<(StreamId, TrackKind, bool)>,
}

pub struct Period {
    pub id: PeriodId,
    /// Monotonically assigned when the period is created (spec §3).
    pub seqnum: u64,
    pub streams: Vec<StreamId>,
    pub tracks: Vec<TrackId>,
    pub collection: StreamCollection,
    pub prepared: bool,
    pub closed: bool,
    pub has_next_period: bool,
    /// Next time (running time, nanoseconds) at which this period should be
    /// reconsidered for input wakeup; `None` if no stream requested one.
    next_wakeup: Option<i64>,
}

impl Period {
    pub fn new(id: PeriodId, seqnum: u64) -> Self {
        Self {
            id,
            seqnum,
            streams: Vec::new(),
            tracks: Vec::new(),
            collection: StreamCollection { streams: Vec::new() },
            prepared: false,
            closed: false,
            has_next_period: false,
            next_wakeup: None,
        }
    }

    pub fn add_stream(&mut self, stream_id: StreamId, kind: TrackKind, select_by_default: bool) {
        self.streams.push(stream_id);
        self.collection.streams.push((stream_id, kind, select_by_default));
    }

    pub fn add_track(&mut self, track_id: TrackId) {
        self.tracks.push(track_id);
    }

    pub fn has_pending_tracks(&self, tracks: &[crate::track::Track]) -> bool {
        self.tracks
            .iter()
            .any(|id| tracks.iter().any(|t| t.id == *id && !t.active))
    }

    /// Reduce per-stream flow codes to one combined status (spec §4.4,
    /// §8 P5): any Flushing short-circuits; any `<= NotNegotiated`
    /// short-circuits to that value; all NotLinked collapses to NotLinked;
    /// all Eos collapses to Eos; otherwise Ok.
    pub fn combine_flows(flows: &[FlowStatus]) -> FlowStatus {
        if flows.is_empty() {
            return FlowStatus::Ok;
        }
        if flows.iter().any(|f| *f == FlowStatus::Flushing) {
            return FlowStatus::Flushing;
        }
        if let Some(bad) = flows
            .iter()
            .filter(|f| (**f as u8) <= (FlowStatus::NotNegotiated as u8))
            .min_by_key(|f| **f as u8)
        {
            return *bad;
        }
        if flows.iter().all(|f| *f == FlowStatus::NotLinked) {
            return FlowStatus::NotLinked;
        }
        if flows.iter().all(|f| *f == FlowStatus::Eos) {
            return FlowStatus::Eos;
        }
        FlowStatus::Ok
    }

    /// Register (or clear) this period's earliest pending input wakeup.
    pub fn set_next_wakeup(&mut self, at: Option<i64>) {
        self.next_wakeup = match (self.next_wakeup, at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (None, x) => x,
            (x, None) => x,
        };
    }

    pub fn take_elapsed_wakeup(&mut self, current_output: i64) -> bool {
        match self.next_wakeup {
            Some(w) if w <= current_output => {
                self.next_wakeup = None;
                true
            }
            _ => false,
        }
    }
}

/// Pick the default track for a stream type: prefers a track flagged
/// "select by default" over the first one encountered (spec §4.4,
/// `select_default_tracks`).
pub fn select_default_track<'a>(
    tracks: &'a [crate::track::Track],
    kind: TrackKind,
) -> Option<&'a crate::track::Track> {
    let mut fallback = None;
    for t in tracks.iter().filter(|t| t.kind == kind) {
        if t.select_by_default {
            return Some(t);
        }
        if fallback.is_none() {
            fallback = Some(t);
        }
    }
    fallback
}

/// Match a track in `next` to one in `current` by stream id, falling back
/// to Kind (spec §4.4 `transfer_selection`, §4.7).
pub fn find_matching_track<'a>(
    next: &'a [crate::track::Track],
    current: &crate::track::Track,
) -> Option<&'a crate::track::Track> {
    next.iter()
        .find(|t| t.stream_id == current.stream_id)
        .or_else(|| next.iter().find(|t| t.kind == current.kind))
}
