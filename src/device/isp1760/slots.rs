//! The transfer slot pool and the lists threaded through it.
//!
//! Every slot lives in one arena entry for its whole life. The free list,
//! the two active lists and the ready list are singly linked through the
//! entries by index, and each entry records which of them currently holds
//! it. A slot that is on no list is held by exactly one party outside the
//! table: a submitting caller, a synchronous waiter or the interrupt
//! handler.
//!
//! The table is only ever touched from inside a
//! [`CriticalSection`](super::bus::CriticalSection).

use std::fmt;

use super::{
    error::SlotError,
    transfer::{Lease, Outcome, PtdClass, SlotId, Transfer},
};

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Initialized,
    Busy,
    Terminal(Outcome),
}

/// Which list a slot is linked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Free,
    /// On no list; owned outside the table.
    Held,
    Active(PtdClass),
    Ready,
}

impl fmt::Display for Place {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Held => write!(f, "held"),
            Self::Active(class) => write!(f, "active {class}"),
            Self::Ready => write!(f, "ready"),
        }
    }
}

/// A snapshot of one slot for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    pub slot: SlotId,
    pub state: SlotState,
    pub place: Place,
}

#[derive(Debug)]
struct Entry {
    state: SlotState,
    place: Place,
    next: Option<usize>,
    /// Bumped on every acquisition.
    generation: u32,
    /// The transfer while the table owns it (active or ready, or parked
    /// for a waiter).
    transfer: Option<Transfer>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Free,
    Active(PtdClass),
    Ready,
}

#[derive(Debug)]
pub(crate) struct SlotTable {
    entries: Vec<Entry>,
    free: Option<usize>,
    periodic: Option<usize>,
    asynchronous: Option<usize>,
    ready: Option<usize>,
}

impl SlotTable {
    /// A table with `pool_size` empty slots, all on the free list in
    /// ascending order.
    pub(crate) fn new(pool_size: usize) -> Self {
        let entries = (0..pool_size)
            .map(|index| Entry {
                state: SlotState::Empty,
                place: Place::Free,
                next: (index + 1 < pool_size).then_some(index + 1),
                generation: 0,
                transfer: None,
            })
            .collect();

        Self {
            entries,
            free: (pool_size > 0).then_some(0),
            periodic: None,
            asynchronous: None,
            ready: None,
        }
    }

    pub(crate) fn pool_size(&self) -> usize {
        self.entries.len()
    }

    fn head_mut(&mut self, list: List) -> &mut Option<usize> {
        match list {
            List::Free => &mut self.free,
            List::Active(PtdClass::Periodic) => &mut self.periodic,
            List::Active(PtdClass::Async) => &mut self.asynchronous,
            List::Ready => &mut self.ready,
        }
    }

    const fn head(&self, list: List) -> Option<usize> {
        match list {
            List::Free => self.free,
            List::Active(PtdClass::Periodic) => self.periodic,
            List::Active(PtdClass::Async) => self.asynchronous,
            List::Ready => self.ready,
        }
    }

    fn iter(&self, list: List) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.head(list), |&index| self.entries[index].next)
    }

    fn push_front(&mut self, list: List, index: usize) {
        let head = self.head_mut(list).replace(index);
        self.entries[index].next = head;
    }

    fn push_back(&mut self, list: List, index: usize) {
        self.entries[index].next = None;
        match self.iter(list).last() {
            Some(tail) => self.entries[tail].next = Some(index),
            None => *self.head_mut(list) = Some(index),
        }
    }

    fn pop_front(&mut self, list: List) -> Option<usize> {
        let index = self.head(list)?;
        *self.head_mut(list) = self.entries[index].next.take();
        Some(index)
    }

    /// Unlink `index` from `list`. Returns false if it was not on it.
    fn unlink(&mut self, list: List, index: usize) -> bool {
        if self.head(list) == Some(index) {
            self.pop_front(list);
            return true;
        }
        let Some(prev) = self.iter(list).find(|&i| self.entries[i].next == Some(index)) else {
            return false;
        };
        self.entries[prev].next = self.entries[index].next.take();
        true
    }

    fn entry(&self, slot: SlotId) -> &Entry {
        &self.entries[slot.index()]
    }

    /// Take a slot off the free list.
    pub(crate) fn acquire(&mut self) -> Option<Lease> {
        let index = self.pop_front(List::Free)?;
        let entry = &mut self.entries[index];
        assert_eq!(
            entry.state,
            SlotState::Empty,
            "slot {index} on the free list is not empty"
        );
        entry.state = SlotState::Initialized;
        entry.place = Place::Held;
        entry.generation = entry.generation.wrapping_add(1);
        Some(Lease {
            slot: SlotId::new(index),
            generation: entry.generation,
        })
    }

    /// Return a held slot to the free list.
    ///
    /// Rejects slots that are already free or handed to a later tenant,
    /// still linked on a list, or whose transfer is in flight. The free list
    /// is left untouched on error.
    pub(crate) fn release(&mut self, lease: Lease) -> Result<(), SlotError> {
        let slot = lease.slot;
        let entry = self
            .entries
            .get_mut(slot.index())
            .ok_or(SlotError::OutOfRange(slot))?;

        if entry.place == Place::Free {
            return Err(SlotError::DoubleRelease(slot));
        }
        if entry.generation != lease.generation {
            return Err(SlotError::StaleRelease(slot));
        }
        match (entry.place, entry.state) {
            (Place::Active(_) | Place::Ready, _) => return Err(SlotError::StillListed(slot)),
            (Place::Held, SlotState::Busy) => return Err(SlotError::ReleaseBusy(slot)),
            _ => {}
        }

        entry.state = SlotState::Empty;
        entry.place = Place::Free;
        entry.transfer = None;
        self.push_front(List::Free, slot.index());
        Ok(())
    }

    /// Hand a held transfer to the hardware side: mark it busy and link it
    /// on the active list of its class.
    pub(crate) fn link_active(&mut self, transfer: Transfer) {
        let index = transfer.slot().index();
        let class = transfer.class();
        let entry = &mut self.entries[index];
        assert_eq!(
            entry.place,
            Place::Held,
            "slot {index} scheduled while {}",
            entry.place
        );
        entry.state = SlotState::Busy;
        entry.place = Place::Active(class);
        entry.transfer = Some(transfer);
        self.push_front(List::Active(class), index);
    }

    /// Unlink every slot of `class` whose bit is set in `done_map` and
    /// take ownership of its transfer.
    ///
    /// Returns the detached transfers and the bits that matched no active
    /// slot.
    pub(crate) fn detach_done(&mut self, class: PtdClass, done_map: u32) -> (Vec<Transfer>, u32) {
        let matched: Vec<usize> = self
            .iter(List::Active(class))
            .filter(|&index| done_map & SlotId::new(index).bit() != 0)
            .collect();

        let mut unmatched = done_map;
        let transfers = matched
            .into_iter()
            .filter_map(|index| {
                unmatched &= !SlotId::new(index).bit();
                self.detach(class, index)
            })
            .collect();

        (transfers, unmatched)
    }

    /// Unlink one active slot, e.g. a stuck transfer.
    pub(crate) fn unlink_active(&mut self, slot: SlotId) -> Option<Transfer> {
        match self.entry(slot).place {
            Place::Active(class) => self.detach(class, slot.index()),
            _ => None,
        }
    }

    fn detach(&mut self, class: PtdClass, index: usize) -> Option<Transfer> {
        let unlinked = self.unlink(List::Active(class), index);
        assert!(unlinked, "slot {index} tagged active {class} but not linked");
        let entry = &mut self.entries[index];
        entry.place = Place::Held;
        entry.transfer.take()
    }

    /// Record the outcome of a transfer whose owner is a synchronous waiter.
    pub(crate) fn park_terminal(&mut self, transfer: Transfer, outcome: Outcome) {
        let entry = &mut self.entries[transfer.slot().index()];
        assert_eq!(entry.place, Place::Held, "parked slot is linked");
        entry.state = SlotState::Terminal(outcome);
        entry.transfer = Some(transfer);
    }

    /// Mark a transfer terminal without parking it, e.g. before its re-arm
    /// hook or its release.
    pub(crate) fn set_terminal(&mut self, slot: SlotId, outcome: Outcome) {
        self.entries[slot.index()].state = SlotState::Terminal(outcome);
    }

    /// Collect the parked result of a waiter's slot.
    pub(crate) fn take_finished(&mut self, slot: SlotId) -> Option<(Outcome, Transfer)> {
        let entry = &mut self.entries[slot.index()];
        match (entry.place, entry.state) {
            (Place::Held, SlotState::Terminal(outcome)) => {
                entry.transfer.take().map(|transfer| (outcome, transfer))
            }
            _ => None,
        }
    }

    /// Queue a completed transfer for its callback.
    pub(crate) fn push_ready(&mut self, transfer: Transfer, outcome: Outcome) {
        let index = transfer.slot().index();
        let entry = &mut self.entries[index];
        assert_eq!(entry.place, Place::Held, "slot {index} queued twice");
        entry.state = SlotState::Terminal(outcome);
        entry.place = Place::Ready;
        entry.transfer = Some(transfer);
        self.push_back(List::Ready, index);
    }

    /// Take the oldest ready transfer. The slot stays terminal and held
    /// until it is released.
    pub(crate) fn pop_ready(&mut self) -> Option<(Outcome, Transfer)> {
        let index = self.pop_front(List::Ready)?;
        let entry = &mut self.entries[index];
        entry.place = Place::Held;
        let SlotState::Terminal(outcome) = entry.state else {
            panic!("slot {index} on the ready list in state {:?}", entry.state);
        };
        let transfer = entry.transfer.take()?;
        Some((outcome, transfer))
    }

    #[cfg(test)]
    pub(crate) fn state(&self, slot: SlotId) -> SlotState {
        self.entry(slot).state
    }

    pub(crate) fn place(&self, slot: SlotId) -> Place {
        self.entry(slot).place
    }

    pub(crate) fn free_count(&self) -> usize {
        self.iter(List::Free).count()
    }

    pub(crate) fn active_slots(&self, class: PtdClass) -> Vec<SlotId> {
        self.iter(List::Active(class)).map(SlotId::new).collect()
    }

    pub(crate) fn snapshot(&self) -> Vec<SlotInfo> {
        self.entries
            .iter()
            .enumerate()
            .map(|(index, entry)| SlotInfo {
                slot: SlotId::new(index),
                state: entry.state,
                place: entry.place,
            })
            .collect()
    }

    /// Verify that every slot is linked exactly where its tag says and in
    /// a state that place allows.
    pub(crate) fn check_invariants(&self) -> Result<(), String> {
        let mut seen = vec![None; self.entries.len()];
        let lists = [
            List::Free,
            List::Active(PtdClass::Periodic),
            List::Active(PtdClass::Async),
            List::Ready,
        ];

        for list in lists {
            for index in self.iter(list) {
                // also stops at the first repeat of a cyclic list
                if let Some(other) = seen[index].replace(list) {
                    return Err(format!("slot {index} linked on {other:?} and {list:?}"));
                }
            }
        }

        for (index, entry) in self.entries.iter().enumerate() {
            let expected = match entry.place {
                Place::Free => Some(List::Free),
                Place::Held => None,
                Place::Active(class) => Some(List::Active(class)),
                Place::Ready => Some(List::Ready),
            };
            if seen[index] != expected {
                return Err(format!(
                    "slot {index} tagged {} but linked on {:?}",
                    entry.place, seen[index]
                ));
            }
            let state_ok = match entry.place {
                Place::Free => entry.state == SlotState::Empty,
                Place::Active(_) => entry.state == SlotState::Busy,
                Place::Ready => matches!(entry.state, SlotState::Terminal(_)),
                Place::Held => entry.state != SlotState::Empty,
            };
            if !state_ok {
                return Err(format!(
                    "slot {index} is {:?} while {}",
                    entry.state, entry.place
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::device::usb::{Direction, Pipe, PipeType, Speed, UsbDevice};

    fn transfer(lease: Lease, class: PtdClass) -> Transfer {
        let pipe_type = match class {
            PtdClass::Periodic => PipeType::Interrupt,
            PtdClass::Async => PipeType::Bulk,
        };
        let pipe = Pipe::new(pipe_type, Direction::In, 1, 1, Speed::High, 3);
        let device = Arc::new(UsbDevice::new(1, Speed::High, None, 64));
        Transfer::new(lease, class, device, pipe)
    }

    #[test]
    fn slots_are_handed_out_in_order_and_recycled_lifo() {
        let mut table = SlotTable::new(4);
        let a = table.acquire().unwrap();
        let b = table.acquire().unwrap();
        assert_eq!((a.slot.index(), b.slot.index()), (0, 1));
        assert_eq!(table.free_count(), 2);

        table.release(a).unwrap();
        assert_eq!(table.acquire().map(|lease| lease.slot), Some(a.slot));
        table.check_invariants().unwrap();
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut table = SlotTable::new(2);
        assert!(table.acquire().is_some());
        assert!(table.acquire().is_some());
        assert_eq!(table.acquire(), None);
    }

    #[test]
    fn double_release_is_rejected_without_touching_the_free_list() {
        let mut table = SlotTable::new(3);
        let lease = table.acquire().unwrap();
        table.release(lease).unwrap();
        let free = table.free_count();

        assert_eq!(
            table.release(lease),
            Err(SlotError::DoubleRelease(lease.slot))
        );
        assert_eq!(table.free_count(), free);
        table.check_invariants().unwrap();
    }

    #[test]
    fn a_stale_lease_cannot_free_the_next_tenant() {
        let mut table = SlotTable::new(2);
        let first = table.acquire().unwrap();
        table.release(first).unwrap();

        let second = table.acquire().unwrap();
        assert_eq!(second.slot, first.slot);
        assert_eq!(
            table.release(first),
            Err(SlotError::StaleRelease(first.slot))
        );
        assert_eq!(table.place(second.slot), Place::Held);

        // the slot must not be handed out twice
        let third = table.acquire().unwrap();
        assert_ne!(third.slot, second.slot);
        assert_eq!(table.acquire(), None);

        table.release(second).unwrap();
        table.release(third).unwrap();
        assert_eq!(table.free_count(), 2);
        table.check_invariants().unwrap();
    }

    #[test]
    fn a_stale_lease_cannot_free_a_parked_result() {
        let mut table = SlotTable::new(1);
        let first = table.acquire().unwrap();
        table.release(first).unwrap();

        let second = table.acquire().unwrap();
        table.park_terminal(transfer(second, PtdClass::Async), Outcome::Success);
        assert_eq!(
            table.release(first),
            Err(SlotError::StaleRelease(first.slot))
        );
        assert!(table.take_finished(second.slot).is_some());
        table.release(second).unwrap();
        table.check_invariants().unwrap();
    }

    #[test]
    fn releasing_a_listed_or_busy_slot_is_rejected() {
        let mut table = SlotTable::new(2);
        let lease = table.acquire().unwrap();
        let slot = lease.slot;
        table.link_active(transfer(lease, PtdClass::Async));
        assert_eq!(table.release(lease), Err(SlotError::StillListed(slot)));

        // detached but still busy: the interrupt handler holds it
        let t = table.unlink_active(slot).unwrap();
        assert_eq!(table.release(lease), Err(SlotError::ReleaseBusy(slot)));

        table.push_ready(t, Outcome::Success);
        assert_eq!(table.release(lease), Err(SlotError::StillListed(slot)));
        table.check_invariants().unwrap();
    }

    #[test]
    fn done_bits_detach_matching_slots_and_report_strays() {
        let mut table = SlotTable::new(8);
        let leases: Vec<_> = (0..3).map(|_| table.acquire().unwrap()).collect();
        for &lease in &leases {
            table.link_active(transfer(lease, PtdClass::Async));
        }
        let slots: Vec<_> = leases.iter().map(|lease| lease.slot).collect();

        let done = slots[0].bit() | slots[2].bit() | (1 << 7);
        let (detached, unmatched) = table.detach_done(PtdClass::Async, done);

        let mut detached: Vec<_> = detached.iter().map(Transfer::slot).collect();
        detached.sort();
        assert_eq!(detached, vec![slots[0], slots[2]]);
        assert_eq!(unmatched, 1 << 7);
        assert_eq!(table.active_slots(PtdClass::Async), vec![slots[1]]);
        assert_eq!(table.place(slots[0]), Place::Held);
        assert_eq!(table.state(slots[0]), SlotState::Busy);
        table.check_invariants().unwrap();
    }

    #[test]
    fn done_bits_of_the_other_class_do_not_match() {
        let mut table = SlotTable::new(2);
        let lease = table.acquire().unwrap();
        let slot = lease.slot;
        table.link_active(transfer(lease, PtdClass::Periodic));

        let (detached, unmatched) = table.detach_done(PtdClass::Async, slot.bit());
        assert!(detached.is_empty());
        assert_eq!(unmatched, slot.bit());
        assert_eq!(table.place(slot), Place::Active(PtdClass::Periodic));
    }

    #[test]
    fn ready_list_is_fifo() {
        let mut table = SlotTable::new(4);
        let leases: Vec<_> = (0..3).map(|_| table.acquire().unwrap()).collect();
        for &lease in &leases {
            table.push_ready(transfer(lease, PtdClass::Async), Outcome::Success);
        }
        let slots: Vec<_> = leases.iter().map(|lease| lease.slot).collect();

        let order: Vec<_> = std::iter::from_fn(|| table.pop_ready())
            .map(|(outcome, t)| {
                assert_eq!(outcome, Outcome::Success);
                t.slot()
            })
            .collect();
        assert_eq!(order, slots);
        assert_eq!(table.state(slots[0]), SlotState::Terminal(Outcome::Success));
        table.check_invariants().unwrap();
    }

    #[test]
    fn parked_results_are_collected_once() {
        let mut table = SlotTable::new(1);
        let lease = table.acquire().unwrap();
        let slot = lease.slot;
        assert!(table.take_finished(slot).is_none());

        table.park_terminal(transfer(lease, PtdClass::Async), Outcome::Halt);
        let (outcome, t) = table.take_finished(slot).unwrap();
        assert_eq!(outcome, Outcome::Halt);
        assert_eq!(t.slot(), slot);
        assert!(table.take_finished(slot).is_none());

        table.release(lease).unwrap();
        table.check_invariants().unwrap();
    }

    #[test]
    #[should_panic(expected = "scheduled while active")]
    fn scheduling_a_linked_slot_panics() {
        let mut table = SlotTable::new(1);
        let lease = table.acquire().unwrap();
        table.link_active(transfer(lease, PtdClass::Async));
        table.link_active(transfer(lease, PtdClass::Async));
    }
}
