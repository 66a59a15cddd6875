//! Selector/SlotManager: maps selected Tracks to persistent Output Slots,
//! handling replacement, pending-track drain hand-off, and stream
//! (re)start (spec §3 "OutputSlot", §4.7).

use crate::collaborators::FlowStatus;
use crate::track::{TrackId, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u64);

/// A durable downstream sink of a given Kind (spec §3).
pub struct OutputSlot {
    pub id: SlotId,
    pub kind: TrackKind,
    pub track: TrackId,
    pub pending_track: Option<TrackId>,
    pub last_flow: FlowStatus,
    pub pushed_timed_data: bool,
}

impl OutputSlot {
    pub fn new(id: SlotId, kind: TrackKind, track: TrackId) -> Self {
        Self {
            id,
            kind,
            track,
            pending_track: None,
            last_flow: FlowStatus::Ok,
            pushed_timed_data: false,
        }
    }
}

/// Outcome of reconciling the desired selection against existing slots
/// (spec §4.7). The caller (OutputPump / API context, under TRACKS_LOCK)
/// acts on each instruction: attaching sticky-event replay, creating or
/// tearing down slots, and marking tracks draining.
#[derive(Debug, Clone)]
pub enum SelectionAction {
    /// Attach `track` as the pending replacement on an existing draining
    /// slot of the same Kind.
    AttachPendingReplacement { slot: SlotId, track: TrackId },
    /// No existing slot of this Kind; create one and emit the full sticky
    /// replay (stream-start, stream-collection, sticky events).
    CreateSlot { kind: TrackKind, track: TrackId },
    /// A track that was selected is no longer desired; mark it draining.
    MarkDraining { track: TrackId },
    /// A slot's pending track is no longer desired; drop the pending slot
    /// (the slot keeps draining its current track).
    DropPending { slot: SlotId },
}

pub struct Selector {
    pub slots: Vec<OutputSlot>,
    pub requested_selection_seqnum: u64,
    pub current_selection_seqnum: u64,
    next_slot_id: u64,
}

impl Default for Selector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            requested_selection_seqnum: 0,
            current_selection_seqnum: 0,
            next_slot_id: 0,
        }
    }

    pub fn alloc_slot_id(&mut self) -> SlotId {
        let id = SlotId(self.next_slot_id);
        self.next_slot_id += 1;
        id
    }

    pub fn selection_pending(&self) -> bool {
        self.requested_selection_seqnum != self.current_selection_seqnum
    }

    fn slot_for_track(&self, track: TrackId) -> Option<&OutputSlot> {
        self.slots.iter().find(|s| s.track == track)
    }

    fn slot_for_kind(&self, kind: TrackKind) -> Option<&OutputSlot> {
        self.slots.iter().find(|s| s.kind == kind)
    }

    /// Reconcile the desired set of tracks (one per Kind at most, per
    /// `select_default_tracks`) against current slots, producing the
    /// actions the caller must apply under TRACKS_LOCK (spec §4.7).
    pub fn reconcile(
        &self,
        desired: &[(TrackKind, TrackId)],
        currently_selected: &[TrackId],
    ) -> Vec<SelectionAction> {
        let mut actions = Vec::new();

        for (kind, track) in desired {
            if self.slot_for_track(*track).is_some() {
                continue; // already attached as the active track
            }
            if let Some(slot) = self.slots.iter().find(|s| s.pending_track == Some(*track)) {
                let _ = slot;
                continue; // already attached as pending
            }
            match self.slot_for_kind(*kind) {
                Some(slot) => actions.push(SelectionAction::AttachPendingReplacement {
                    slot: slot.id,
                    track: *track,
                }),
                None => actions.push(SelectionAction::CreateSlot {
                    kind: *kind,
                    track: *track,
                }),
            }
        }

        let desired_tracks: Vec<TrackId> = desired.iter().map(|(_, t)| *t).collect();
        for track in currently_selected {
            if !desired_tracks.contains(track) {
                actions.push(SelectionAction::MarkDraining { track: *track });
            }
        }

        for slot in &self.slots {
            if let Some(pending) = slot.pending_track {
                if !desired_tracks.contains(&pending) {
                    actions.push(SelectionAction::DropPending { slot: slot.id });
                }
            }
        }

        actions
    }

    /// Whether a `streams-selected` notification should fire: every slot's
    /// current track must be active and there must be no pending
    /// replacement left unattached to a ready track (spec §4.7).
    pub fn all_selected_tracks_active(&self, presentation: &crate::presentation::Presentation) -> bool {
        !self.slots.is_empty()
            && self.slots.iter().all(|slot| {
                slot.pending_track.is_none()
                    && presentation.track(slot.track).is_some_and(|t| t.active)
            })
    }

    /// A replacement is ready to switch when the pending track has
    /// buffered at least its watermark threshold, or the current track has
    /// reached EOS (spec §4.6 step 3, §8 scenario 4).
    pub fn replacement_ready(
        current: &crate::track::Track,
        pending: &crate::track::Track,
    ) -> bool {
        pending.level_time >= pending.buffering_threshold || current.eos
    }
}
