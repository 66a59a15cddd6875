//! Per-track ordered cache of sticky events with a pending flag (spec §3,
//! §4.2, §8 P7).
//!
//! Sticky events are the ones that must be present on a Slot before any
//! data flows and must be replayed whenever a Track attaches to a new Slot:
//! stream-start, caps, segment, tag, custom-sticky. `EventStore` tracks one
//! slot per sticky kind plus whether that slot has been delivered to the
//! current Slot since it was last (re)set.

use crate::track::StreamEvent;

/// The sticky-event kinds the store tracks, in delivery-priority order
/// (spec §5 "Ordering guarantees": stream-start, then segment, then any
/// others; EOS is never sticky and is not stored here).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum StickyKind {
    StreamStart,
    Segment,
    Caps,
    Tag,
    Custom,
}

fn sticky_kind_of(event: &StreamEvent) -> Option<StickyKind> {
    match event {
        StreamEvent::StreamStart { .. } => Some(StickyKind::StreamStart),
        StreamEvent::Segment(_) => Some(StickyKind::Segment),
        StreamEvent::Caps { .. } => Some(StickyKind::Caps),
        StreamEvent::Tag { .. } => Some(StickyKind::Tag),
        StreamEvent::CustomSticky { .. } => Some(StickyKind::Custom),
        StreamEvent::Gap { .. }
        | StreamEvent::Eos
        | StreamEvent::FlushStart { .. }
        | StreamEvent::FlushStop { .. }
        | StreamEvent::RateChange { .. } => None,
    }
}

#[derive(Debug, Clone)]
struct StickySlot {
    event: StreamEvent,
    pending: bool,
}

/// Ordered cache of the latest sticky event of each kind.
#[derive(Debug, Default)]
pub struct EventStore {
    slots: Vec<(StickyKind, StickySlot)>,
}

impl EventStore {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Store `event`, replacing any existing event of the same sticky kind.
    /// A freshly stored event starts pending unless `already_pending` was
    /// requested to stay false (used when replaying without re-marking).
    /// Returns `false` without storing if `event` is not a sticky kind.
    pub fn store(&mut self, event: StreamEvent) -> bool {
        let Some(kind) = sticky_kind_of(&event) else {
            return false;
        };
        match self.slots.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, slot)) => {
                slot.event = event;
                slot.pending = true;
            }
            None => {
                self.slots.push((
                    kind,
                    StickySlot {
                        event,
                        pending: true,
                    },
                ));
                self.slots.sort_by_key(|(k, _)| *k);
            }
        }
        true
    }

    /// Mark every stored sticky event as pending again, used when a Track
    /// attaches to a new Slot and must replay its full sticky state.
    pub fn mark_all_undelivered(&mut self) {
        for (_, slot) in &mut self.slots {
            slot.pending = true;
        }
    }

    /// Return the next pending sticky event in priority order without
    /// consuming it; call `mark_delivered` once it has actually been
    /// pushed downstream.
    pub fn get_next_pending(&self) -> Option<&StreamEvent> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.pending)
            .map(|(_, slot)| &slot.event)
    }

    /// Clear the pending flag for whichever slot currently holds `event`'s
    /// sticky kind; other slots are left unchanged.
    pub fn mark_delivered(&mut self, event: &StreamEvent) {
        let Some(kind) = sticky_kind_of(event) else {
            return;
        };
        if let Some((_, slot)) = self.slots.iter_mut().find(|(k, _)| *k == kind) {
            slot.pending = false;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
