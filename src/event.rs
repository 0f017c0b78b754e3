//! Discrete-event engine: a time-ordered queue plus a churn-free free-list.
//!
//! Simulated time never moves backward. Events may still be scheduled with a
//! timestamp earlier than the current clock ("late events") — an external
//! driver relies on this — but [`Engine::next`] only ever advances `now`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use serde::{Deserialize, Serialize};

use crate::bus::InterruptReason;
use crate::trace::Request;

/// Simulated time, measured in the same units as the parameter file's
/// latencies (milliseconds by convention, never interpreted by the core).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimTime(pub f64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0.0);

    pub fn after(self, delta: f64) -> SimTime {
        SimTime(self.0 + delta)
    }

    pub fn since(self, earlier: SimTime) -> f64 {
        self.0 - earlier.0
    }
}

impl Eq for SimTime {}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.0.partial_cmp(&other.0)
    }
}

impl Ord for SimTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(Ordering::Equal)
    }
}

impl std::ops::Add<f64> for SimTime {
    type Output = SimTime;
    fn add(self, rhs: f64) -> SimTime {
        SimTime(self.0 + rhs)
    }
}

/// Identifies a device (one SSD) within a [`crate::Simulator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

/// Identifies an element (flash package) within a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementId(pub u32);

/// Identifies a gang (group of elements) within a device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GangId(pub u32);

/// A scheduled occurrence. The event type is the tag; [`Payload`] carries the
/// typed data, resolving the source's type-punned payload into a sum type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EventKind {
    IoAccessArrive,
    DeviceOverheadComplete,
    DeviceDataTransferComplete,
    DeviceAccessComplete,
    IoInterruptComplete(InterruptReason),
    CleanElement,
    CleanGang,
    NullEvent,
    Checkpoint,
    StopSim,
    Exit,
}

/// Typed event payload. `None` covers events that only need `device`/`kind`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Payload {
    None,
    Request(Request),
    Element(ElementId),
    Gang(GangId),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub time: SimTime,
    pub seq: u64,
    pub device: DeviceId,
    pub kind: EventKind,
    pub payload: Payload,
}

/// Opaque handle returned by [`Engine::schedule`], usable with [`Engine::deschedule`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventHandle(usize);

/// Slab-backed index for the heap: `(time, seq)` orders by time then
/// insertion order so ties resolve FIFO (§5 "Ordering guarantees").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct HeapKey {
    time: SimTime,
    seq: u64,
    slot: usize,
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest (time, seq) pops first.
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Priority queue of pending events plus a free-list of slab slots so
/// `alloc`/`recycle` never reorder live events and amortize to O(1).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Engine {
    slots: Vec<Option<Event>>,
    free: Vec<usize>,
    #[serde(skip)]
    heap: BinaryHeap<HeapKey>,
    now: SimTime,
    next_seq: u64,
}

const GROW_BATCH: usize = 256;

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Rebuild the heap index from `slots` after deserializing a checkpoint.
    /// The heap is intentionally not part of the serialized form: `slots` is
    /// the single source of truth and the index is cheap to recompute.
    pub fn rebuild_heap(&mut self) {
        self.heap.clear();
        for (slot, event) in self.slots.iter().enumerate() {
            if let Some(event) = event {
                self.heap.push(HeapKey {
                    time: event.time,
                    seq: event.seq,
                    slot,
                });
            }
        }
    }

    fn alloc_slot(&mut self) -> usize {
        if let Some(slot) = self.free.pop() {
            return slot;
        }
        let base = self.slots.len();
        self.slots.reserve(GROW_BATCH);
        for _ in 0..GROW_BATCH {
            self.slots.push(None);
            self.free.push(self.slots.len() - 1);
        }
        self.free.pop().unwrap_or(base)
    }

    /// Insert `event` into the time-ordered queue. Past-time ("late")
    /// events are accepted without adjustment; the clock only moves forward
    /// in [`Engine::next`].
    pub fn schedule(
        &mut self,
        time: SimTime,
        device: DeviceId,
        kind: EventKind,
        payload: Payload,
    ) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let slot = self.alloc_slot();
        self.slots[slot] = Some(Event {
            time,
            seq,
            device,
            kind,
            payload,
        });
        self.heap.push(HeapKey { time, seq, slot });
        EventHandle(slot)
    }

    /// Remove and return the earliest pending event, advancing the clock to
    /// its time. Returns `None` when the queue is empty.
    pub fn next(&mut self) -> Option<Event> {
        while let Some(key) = self.heap.pop() {
            // The slot may have been recycled via `deschedule`; skip stale keys.
            if let Some(event) = self.slots[key.slot].take() {
                self.free.push(key.slot);
                if event.time > self.now {
                    self.now = event.time;
                }
                return Some(event);
            }
        }
        None
    }

    /// Cancel a pending event. Returns `false` if it already fired or was
    /// already descheduled.
    pub fn deschedule(&mut self, handle: EventHandle) -> bool {
        match self.slots.get_mut(handle.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.free.push(handle.0);
                true
            }
            _ => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev() -> DeviceId {
        DeviceId(0)
    }

    #[test]
    fn fifo_ties_break_by_insertion_order() {
        let mut e = Engine::new();
        e.schedule(SimTime(1.0), dev(), EventKind::NullEvent, Payload::None);
        e.schedule(SimTime(1.0), dev(), EventKind::StopSim, Payload::None);
        e.schedule(SimTime(1.0), dev(), EventKind::Exit, Payload::None);
        let kinds: Vec<_> = std::iter::from_fn(|| e.next())
            .map(|ev| ev.kind)
            .collect();
        assert!(matches!(kinds[0], EventKind::NullEvent));
        assert!(matches!(kinds[1], EventKind::StopSim));
        assert!(matches!(kinds[2], EventKind::Exit));
    }

    #[test]
    fn clock_never_moves_backward_even_for_late_events() {
        let mut e = Engine::new();
        e.schedule(SimTime(10.0), dev(), EventKind::NullEvent, Payload::None);
        let first = e.next().unwrap();
        assert_eq!(first.time, SimTime(10.0));
        assert_eq!(e.now(), SimTime(10.0));

        // A "late" event behind the current clock is still accepted...
        e.schedule(SimTime(5.0), dev(), EventKind::NullEvent, Payload::None);
        let second = e.next().unwrap();
        assert_eq!(second.time, SimTime(5.0));
        // ...but the clock itself does not go backward.
        assert_eq!(e.now(), SimTime(10.0));
    }

    #[test]
    fn deschedule_cancels_a_pending_event() {
        let mut e = Engine::new();
        let h = e.schedule(SimTime(1.0), dev(), EventKind::NullEvent, Payload::None);
        assert!(e.deschedule(h));
        assert!(!e.deschedule(h));
        assert!(e.next().is_none());
    }

    #[test]
    fn alloc_and_recycle_do_not_reorder_live_events() {
        let mut e = Engine::new();
        let mut handles = Vec::new();
        for i in 0..10 {
            handles.push(e.schedule(
                SimTime(i as f64),
                dev(),
                EventKind::NullEvent,
                Payload::None,
            ));
        }
        // Cancel every other event, then drain; survivors must come out in time order.
        for h in handles.iter().step_by(2) {
            e.deschedule(*h);
        }
        let times: Vec<_> = std::iter::from_fn(|| e.next()).map(|ev| ev.time.0).collect();
        assert_eq!(times, vec![1.0, 3.0, 5.0, 7.0, 9.0]);
    }

    #[test]
    fn heap_rebuild_after_checkpoint_restores_ordering() {
        let mut e = Engine::new();
        e.schedule(SimTime(3.0), dev(), EventKind::NullEvent, Payload::None);
        e.schedule(SimTime(1.0), dev(), EventKind::NullEvent, Payload::None);
        e.schedule(SimTime(2.0), dev(), EventKind::NullEvent, Payload::None);
        e.heap.clear();
        e.rebuild_heap();
        let times: Vec<_> = std::iter::from_fn(|| e.next()).map(|ev| ev.time.0).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0]);
    }
}
