//! OutputPump: the dedicated Output-context worker that drains Tracks to
//! the downstream sink in non-decreasing `global_output` order (spec §4.6,
//! §5 "Output context: one dedicated worker thread").
//!
//! Unlike the Scheduler context (Reactor, tokio-driven), the pump runs on
//! a plain `std::thread` and blocks synchronously on the `tracks_added`
//! condition — it is the one place in this crate that is allowed to
//! block, matching spec §5's "Output context ... blocks on a condition
//! variable tied to the tracks lock".

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::bus::{BusSink, Notification};
use crate::collaborators::{DownstreamSlotSink, FlowStatus};
use crate::period::Period;
use crate::presentation::{Presentation, TracksLock};
use crate::selector::{OutputSlot, Selector, SlotId};
use crate::track::{QueuedItemPayload, StreamEvent, TrackId, TrackKind};

/// How long a single wait on `tracks_added` blocks before the pump
/// rechecks state on its own (bounds staleness when a wakeup is missed).
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// What the last `step()` call did, useful for tests and for the run loop
/// to decide whether to loop immediately or has already blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Pushed at least one item, or advanced a period; caller should call
    /// `step()` again immediately.
    Progressed,
    /// Blocked on `tracks_added` (empty selected track, or unknown
    /// global output) and returned after the wait elapsed or was woken.
    Waited,
    /// Downstream reported a fatal or fully-disconnected flow; EOS was
    /// sent to every slot and the pump is now paused.
    Failed,
    /// `flushing` was set; the pump parked and returned without touching
    /// slots.
    Flushing,
}

pub struct OutputPump {
    tracks: Arc<TracksLock>,
    bus: Arc<dyn BusSink>,
    downstream: Arc<dyn DownstreamSlotSink>,
    stop: AtomicBool,
    paused: AtomicBool,
    /// Previous result of `Selector::all_selected_tracks_active`, to detect
    /// the false->true transition that fires `StreamsSelected` (spec §4.7).
    streams_selected_active: AtomicBool,
    /// Mirrors `GstAdaptiveDemuxPrivate::is_buffering`/`percent`
    /// (`demux_update_buffering_locked`): `Buffering` is only posted while
    /// filling (percent < 100), and re-armed once percent drops back < 1.
    is_buffering: AtomicBool,
    last_buffering_percent: AtomicU8,
}

impl OutputPump {
    pub fn new(
        tracks: Arc<TracksLock>,
        bus: Arc<dyn BusSink>,
        downstream: Arc<dyn DownstreamSlotSink>,
    ) -> Self {
        Self {
            tracks,
            bus,
            downstream,
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            streams_selected_active: AtomicBool::new(false),
            is_buffering: AtomicBool::new(false),
            last_buffering_percent: AtomicU8::new(0),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Signal the run loop to exit after its current step and wake it if
    /// it is currently parked on `tracks_added`.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.tracks.notify_tracks_added();
    }

    /// Spawn the pump body on a dedicated thread (spec §5). Returns the
    /// `JoinHandle` so the owner can await shutdown.
    pub fn spawn(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("output-pump".into())
            .spawn(move || {
                while !self.stop.load(Ordering::Acquire) {
                    self.step();
                }
                debug!("output pump thread exiting");
            })
            .expect("failed to spawn output pump thread")
    }

    /// One pass of the spec §4.6 numbered body. Each numbered comment
    /// below corresponds to that step.
    pub fn step(&self) -> PumpOutcome {
        // 1. If flushing, pause and return.
        {
            let mut guard = self.tracks.lock();
            if guard.flushing {
                self.paused.store(true, Ordering::Release);
                self.tracks.wait_tracks_added(&mut guard, WAIT_POLL_INTERVAL);
                return PumpOutcome::Flushing;
            }
        }
        self.paused.store(false, Ordering::Release);

        // 2. Reconcile selection if requested != current.
        {
            let mut guard = self.tracks.lock();
            if guard.selector.selection_pending() {
                reconcile_selection(&mut guard);
            }
        }

        // 3. Switch ready replacements, recompute global_output, refresh
        // each track's buffering level against it.
        let global_output = {
            let mut guard = self.tracks.lock();
            switch_ready_replacements(&mut guard);
            let go = compute_global_output(&guard);
            guard.global_output_time = go;
            for track in guard.tracks_iter_mut() {
                track.update_level(go);
            }
            go
        };

        // 3a. Detect the streams-selected transition: every slot's current
        // track active and no unattached pending replacement (spec §4.7,
        // `gstadaptivedemux.c`'s post-reconcile streams-selected check).
        {
            let guard = self.tracks.lock();
            let all_active = guard.selector.all_selected_tracks_active(&guard);
            let selection_seqnum = guard.selector.current_selection_seqnum;
            drop(guard);
            let was_active = self.streams_selected_active.swap(all_active, Ordering::AcqRel);
            if all_active && !was_active {
                self.bus.post(Notification::StreamsSelected { selection_seqnum });
            }
        }

        // 3b. Buffering-percent crossing over the OutputPeriod's active,
        // selected tracks (spec §4.2, `demux_update_buffering_locked`).
        {
            let guard = self.tracks.lock();
            let percent = guard
                .output_period_id()
                .and_then(|id| compute_buffering_percent(&guard, id));
            drop(guard);
            if let Some(percent) = percent {
                self.maybe_post_buffering(percent);
            }
        }

        // 4. Wait if a selected track is empty and not EOS.
        {
            let mut guard = self.tracks.lock();
            if any_selected_track_starved(&guard) {
                self.tracks.wait_tracks_added(&mut guard, WAIT_POLL_INTERVAL);
                return PumpOutcome::Waited;
            }
        }

        // 5. Advance period if everything in the OutputPeriod is empty and
        // there is a successor.
        {
            let mut guard = self.tracks.lock();
            if let Some(output_id) = guard.output_period_id() {
                let drained = guard
                    .period(output_id)
                    .map(|p| p.tracks.iter().all(|id| {
                        guard.track(*id).map(|t| t.is_empty()).unwrap_or(true)
                    }))
                    .unwrap_or(false);
                let has_next = guard
                    .period(output_id)
                    .map(|p| p.has_next_period)
                    .unwrap_or(false);
                if drained && has_next {
                    guard.advance_period();
                    guard.selector.requested_selection_seqnum += 1;
                    let count = guard
                        .output_period_id()
                        .and_then(|id| guard.period(id))
                        .map(|p| p.streams.len())
                        .unwrap_or(0);
                    let seqnum = guard
                        .output_period_id()
                        .and_then(|id| guard.period(id))
                        .map(|p| p.seqnum)
                        .unwrap_or(0);
                    drop(guard);
                    self.bus.post(Notification::StreamCollection {
                        period_seqnum: seqnum,
                        stream_count: count,
                    });
                    return PumpOutcome::Progressed;
                }
            }
        }

        // 6. Service every slot whose next-position has caught up to
        // global_output, or which has not emitted anything yet.
        let slot_ids: Vec<SlotId> = self.tracks.lock().selector.slots.iter().map(|s| s.id).collect();
        let mut flows = Vec::with_capacity(slot_ids.len());
        for slot_id in slot_ids {
            if let Some(flow) = self.service_slot(slot_id, global_output) {
                flows.push(flow);
            }
        }

        // 7. Record global_output_position and check per-period wakeups:
        // a stream parked in WaitingOutputSpace is released once its
        // period's earliest requested wakeup time has elapsed.
        if let Some(go) = global_output {
            let mut guard = self.tracks.lock();
            if let Some(output_id) = guard.output_period_id() {
                let elapsed = guard
                    .period_mut(output_id)
                    .map(|period| period.take_elapsed_wakeup(go))
                    .unwrap_or(false);
                if elapsed {
                    let stream_ids = guard
                        .period(output_id)
                        .map(|p| p.streams.clone())
                        .unwrap_or_default();
                    for stream_id in stream_ids {
                        if let Some(stream) = guard.stream_mut(stream_id) {
                            stream.output_space_available();
                        }
                    }
                }
            }
        }

        let combined = Period::combine_flows(&flows);
        if combined.is_fatal_for_pump() || combined == FlowStatus::NotLinked {
            warn!(?combined, "downstream unhealthy, emitting EOS to all slots");
            let mut guard = self.tracks.lock();
            emit_eos_to_all_slots(&mut guard, self.downstream.as_ref());
            self.paused.store(true, Ordering::Release);
            return PumpOutcome::Failed;
        }

        // 8. Pause if no track anywhere has pending timed data.
        if global_output.is_none() {
            let mut guard = self.tracks.lock();
            if !any_track_has_pending_data(&guard) {
                self.paused.store(true, Ordering::Release);
                self.tracks.wait_tracks_added(&mut guard, WAIT_POLL_INTERVAL);
                return PumpOutcome::Waited;
            }
        }

        PumpOutcome::Progressed
    }

    fn service_slot(&self, slot_id: SlotId, global_output: crate::clock::RunningTime) -> Option<FlowStatus> {
        let (track_id, kind, mut item, period_has_next) = {
            let mut guard = self.tracks.lock();
            let slot = guard.selector.slots.iter().find(|s| s.id == slot_id)?;
            let track_id = slot.track;
            let kind = slot.kind;
            let pushed_timed_data = slot.pushed_timed_data;

            let should_service = {
                let track = guard.track(track_id)?;
                if !pushed_timed_data {
                    true
                } else {
                    match (track.output_time, global_output) {
                        (Some(next), Some(go)) => next <= go,
                        _ => false,
                    }
                }
            };
            if !should_service {
                return None;
            }

            let period_has_next = guard
                .output_period_id()
                .and_then(|id| guard.period(id))
                .map(|p| p.has_next_period)
                .unwrap_or(false);

            let track = guard.track_mut(track_id)?;
            let item = track.dequeue(true, global_output)?;
            (track_id, kind, item, period_has_next)
        };

        if let QueuedItemPayload::Buffer { flags, .. } = &mut item.payload {
            let mut guard = self.tracks.lock();
            if let Some(track) = guard.track_mut(track_id) {
                if track.output_discont {
                    flags.discont = true;
                    track.output_discont = false;
                }
            }
        }

        let suppress_eos =
            matches!(item.payload, QueuedItemPayload::Event(StreamEvent::Eos)) && period_has_next;
        let pushed_timed = matches!(
            item.payload,
            QueuedItemPayload::Buffer { .. } | QueuedItemPayload::Gap { .. }
        );
        let rt_for_position = item.rt_end.or(item.rt_start);

        let flow = if suppress_eos {
            FlowStatus::Ok
        } else {
            self.downstream.push(kind, item)
        };

        let mut guard = self.tracks.lock();
        if let Some(track) = guard.track_mut(track_id) {
            track.update_next_position(rt_for_position);
        }
        if let Some(slot) = guard.selector.slots.iter_mut().find(|s| s.id == slot_id) {
            slot.last_flow = flow;
            if pushed_timed {
                slot.pushed_timed_data = true;
            }
        }
        Some(flow)
    }

    /// Port of `demux_update_buffering_locked`'s `is_buffering`/`percent`
    /// state machine: post only while filling, and re-arm once the level
    /// drops back below 1% after having reached 100%.
    fn maybe_post_buffering(&self, percent: u8) {
        let was_buffering = self.is_buffering.load(Ordering::Acquire);
        let changed = if was_buffering {
            if percent >= 100 {
                self.is_buffering.store(false, Ordering::Release);
            }
            self.last_buffering_percent.swap(percent, Ordering::AcqRel) != percent
        } else if percent < 1 {
            self.is_buffering.store(true, Ordering::Release);
            self.last_buffering_percent.swap(percent, Ordering::AcqRel) != percent
        } else {
            false
        };
        if changed {
            self.bus.post(Notification::Buffering { percent });
        }
    }
}

/// Lowest buffering percent across the OutputPeriod's active, selected,
/// non-EOS tracks; `None` means no track yet has a non-zero
/// `buffering_threshold` to judge by and at least one is still filling, so
/// the caller should skip posting entirely (spec §4.2,
/// `demux_update_buffering_locked`).
fn compute_buffering_percent(guard: &Presentation, output_id: crate::period::PeriodId) -> Option<u8> {
    let Some(track_ids) = guard.period(output_id).map(|p| p.tracks.clone()) else {
        return None;
    };
    let mut min_percent: Option<i64> = None;
    let mut all_eos = true;
    for track_id in track_ids {
        let Some(track) = guard.track(track_id) else {
            continue;
        };
        if !track.active || !track.selected || track.eos {
            continue;
        }
        all_eos = false;
        if !track.buffering_threshold.is_zero() {
            let cur_percent = (track.level_time.as_nanos() * 100
                / track.buffering_threshold.as_nanos()) as i64;
            min_percent = Some(match min_percent {
                Some(p) if p <= cur_percent => p,
                _ => cur_percent,
            });
        }
    }
    if min_percent.is_none() && !all_eos {
        return None;
    }
    let percent = if all_eos {
        100
    } else {
        min_percent.unwrap_or(100).clamp(0, 100)
    };
    Some(percent as u8)
}

fn reconcile_selection(guard: &mut Presentation) {
    let desired: Vec<(TrackKind, TrackId)> = guard
        .tracks_iter()
        .filter(|t| t.selected)
        .map(|t| (t.kind, t.id))
        .collect();
    let currently_selected: Vec<TrackId> = guard.selector.slots.iter().map(|s| s.track).collect();
    let actions = guard.selector.reconcile(&desired, &currently_selected);

    for action in actions {
        match action {
            crate::selector::SelectionAction::AttachPendingReplacement { slot, track } => {
                if let Some(s) = guard.selector.slots.iter_mut().find(|s| s.id == slot) {
                    s.pending_track = Some(track);
                }
            }
            crate::selector::SelectionAction::CreateSlot { kind, track } => {
                let id = guard.selector.alloc_slot_id();
                guard.selector.slots.push(OutputSlot::new(id, kind, track));
                if let Some(t) = guard.track_mut(track) {
                    t.events.mark_all_undelivered();
                    t.active = true;
                    t.override_next_segment = true;
                }
            }
            crate::selector::SelectionAction::MarkDraining { track } => {
                if let Some(t) = guard.track_mut(track) {
                    t.draining = true;
                }
            }
            crate::selector::SelectionAction::DropPending { slot } => {
                if let Some(s) = guard.selector.slots.iter_mut().find(|s| s.id == slot) {
                    s.pending_track = None;
                }
            }
        }
    }
    guard.selector.current_selection_seqnum = guard.selector.requested_selection_seqnum;
}

fn switch_ready_replacements(guard: &mut Presentation) {
    let pending_slots: Vec<SlotId> = guard
        .selector
        .slots
        .iter()
        .filter(|s| s.pending_track.is_some())
        .map(|s| s.id)
        .collect();

    for slot_id in pending_slots {
        let (current_id, pending_id) = {
            let slot = guard.selector.slots.iter().find(|s| s.id == slot_id).unwrap();
            (slot.track, slot.pending_track.unwrap())
        };
        let ready = match (guard.track(current_id), guard.track(pending_id)) {
            (Some(cur), Some(pend)) => Selector::replacement_ready(cur, pend),
            _ => false,
        };
        if !ready {
            continue;
        }
        if let Some(t) = guard.track_mut(pending_id) {
            t.events.mark_all_undelivered();
            t.active = true;
            t.override_next_segment = true;
        }
        if let Some(t) = guard.track_mut(current_id) {
            t.active = false;
            t.draining = true;
        }
        if let Some(slot) = guard.selector.slots.iter_mut().find(|s| s.id == slot_id) {
            slot.track = pending_id;
            slot.pending_track = None;
            slot.pushed_timed_data = false;
        }
    }
}

fn compute_global_output(guard: &Presentation) -> crate::clock::RunningTime {
    guard
        .selector
        .slots
        .iter()
        .filter_map(|s| guard.track(s.track))
        .filter(|t| t.active)
        .filter_map(|t| t.output_time)
        .min()
}

fn any_selected_track_starved(guard: &Presentation) -> bool {
    guard
        .selector
        .slots
        .iter()
        .filter_map(|s| guard.track(s.track))
        .any(|t| t.active && t.is_empty() && !t.eos)
}

fn any_track_has_pending_data(guard: &Presentation) -> bool {
    guard.tracks_iter().any(|t| !t.is_empty())
}

fn emit_eos_to_all_slots(guard: &mut Presentation, downstream: &dyn DownstreamSlotSink) {
    let slot_kinds: Vec<(SlotId, TrackKind)> = guard.selector.slots.iter().map(|s| (s.id, s.kind)).collect();
    for (_, kind) in slot_kinds {
        let item = crate::track::QueuedItem::eos_for_pump();
        let _ = downstream.push(kind, item);
    }
}
