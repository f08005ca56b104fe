//! Core timing: a virtual cycle clock and a queue of timed events.
//!
//! The clock only moves when the run loop commits executed cycles or idles. Events fire in
//! (target cycle, insertion order) order, and an event scheduled from a callback for a time that
//! has already been reached fires in the same `advance` pass.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use log::trace;

use crate::Kernel;

pub const BASE_CLOCK_RATE_ARM11: u64 = 268_111_856;
pub const MAX_SLICE_LENGTH: u64 = 20_000;

pub fn ns_to_cycles(ns: u64) -> u64 {
    ((ns as u128 * BASE_CLOCK_RATE_ARM11 as u128) / 1_000_000_000) as u64
}

pub fn cycles_to_ns(cycles: u64) -> u64 {
    ((cycles as u128 * 1_000_000_000) / BASE_CLOCK_RATE_ARM11 as u128) as u64
}

pub fn ms_to_cycles(ms: u64) -> u64 {
    ns_to_cycles(ms * 1_000_000)
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct EventType(usize);

/// Called with the kernel, the userdata given at schedule time and how many cycles late it fired.
pub type TimedCallback = Box<dyn FnMut(&mut Kernel, u64, u64)>;

struct EventSlot {
    name: String,
    callback: Option<TimedCallback>,
}

#[derive(Debug, Copy, Clone)]
pub struct QueuedEvent {
    pub time: u64,
    fifo_order: u64,
    pub event_type: EventType,
    pub userdata: u64,
}

impl QueuedEvent {
    fn key(&self) -> (u64, u64) {
        (self.time, self.fifo_order)
    }
}

// fifo_order is unique per queue, so the key identifies the event
impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

pub struct Timing {
    ticks: u64,
    slice_length: u64,
    slice_end: u64,
    idled_cycles: u64,
    next_fifo: u64,
    queue: BinaryHeap<Reverse<QueuedEvent>>,
    types: Vec<EventSlot>,
}

impl Timing {
    pub fn new(slice_length: u64) -> Timing {
        assert!(slice_length > 0);
        Timing {
            ticks: 0,
            slice_length,
            slice_end: slice_length,
            idled_cycles: 0,
            next_fifo: 0,
            queue: BinaryHeap::new(),
            types: vec![],
        }
    }

    pub fn register_event(&mut self, name: &str, callback: TimedCallback) -> EventType {
        assert!(
            self.types.iter().all(|slot| slot.name != name),
            "Event type {} registered twice", name
        );
        self.types.push(EventSlot {
            name: name.to_owned(),
            callback: Some(callback),
        });
        EventType(self.types.len() - 1)
    }

    pub fn event_name(&self, event_type: EventType) -> &str {
        &self.types[event_type.0].name
    }

    /// Schedules `event_type` to fire `cycles_into_future` cycles from now.
    pub fn schedule_event(&mut self, cycles_into_future: u64, event_type: EventType, userdata: u64) {
        assert!(event_type.0 < self.types.len(), "Unknown event type {:?}", event_type);
        let time = self.ticks.saturating_add(cycles_into_future);
        let fifo_order = self.next_fifo;
        self.next_fifo += 1;

        trace!("schedule {} at {} (userdata {:#X})", self.types[event_type.0].name, time, userdata);

        self.queue.push(Reverse(QueuedEvent { time, fifo_order, event_type, userdata }));

        // Cut the current slice short so the run loop comes back in time
        if time < self.slice_end {
            self.slice_end = time.max(self.ticks);
        }
    }

    /// Removes every queued event matching both the type and the userdata.
    pub fn remove_event(&mut self, event_type: EventType, userdata: u64) {
        if !self.queue.iter().any(|Reverse(e)| e.event_type == event_type && e.userdata == userdata) {
            return
        }
        let events = std::mem::take(&mut self.queue).into_vec();
        self.queue = events.into_iter()
            .filter(|Reverse(e)| !(e.event_type == event_type && e.userdata == userdata))
            .collect();
    }

    pub fn remove_all_events(&mut self, event_type: EventType) {
        let events = std::mem::take(&mut self.queue).into_vec();
        self.queue = events.into_iter()
            .filter(|Reverse(e)| e.event_type != event_type)
            .collect();
    }

    pub fn is_scheduled(&self, event_type: EventType, userdata: u64) -> bool {
        self.queue.iter().any(|Reverse(e)| e.event_type == event_type && e.userdata == userdata)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn idled_cycles(&self) -> u64 {
        self.idled_cycles
    }

    pub fn add_ticks(&mut self, cycles: u64) {
        self.ticks += cycles;
    }

    pub fn slice_length(&self) -> u64 {
        self.slice_length
    }

    /// Cycles left in the current slice; the execution engine's budget.
    pub fn downcount(&self) -> u64 {
        self.slice_end.saturating_sub(self.ticks)
    }

    pub fn next_event_time(&self) -> Option<u64> {
        self.queue.peek().map(|Reverse(e)| e.time)
    }

    pub fn pending_events(&self) -> usize {
        self.queue.len()
    }

    /// Pops the earliest event if it is due.
    pub fn pop_due_event(&mut self) -> Option<QueuedEvent> {
        match self.queue.peek() {
            Some(Reverse(e)) if e.time <= self.ticks => self.queue.pop().map(|Reverse(e)| e),
            _ => None,
        }
    }

    pub fn start_slice(&mut self) {
        let end = self.ticks + self.slice_length;
        self.slice_end = match self.next_event_time() {
            Some(time) if time < end => time.max(self.ticks),
            _ => end,
        };
    }

    /// Fast-forwards to the next event, or to the end of the slice if nothing is queued.
    pub fn idle(&mut self) {
        let target = self.next_event_time().unwrap_or(self.slice_end);
        if target > self.ticks {
            self.idled_cycles += target - self.ticks;
            self.ticks = target;
        }
    }

    pub(crate) fn take_callback(&mut self, event_type: EventType) -> TimedCallback {
        self.types[event_type.0].callback.take()
            .unwrap_or_else(|| panic!("Reentrant dispatch of {}", self.types[event_type.0].name))
    }

    pub(crate) fn restore_callback(&mut self, event_type: EventType, callback: TimedCallback) {
        let slot = &mut self.types[event_type.0].callback;
        assert!(slot.is_none());
        *slot = Some(callback);
    }
}

impl Kernel {
    /// Fires every due event in order, then starts a new slice.
    pub fn advance_timing(&mut self) {
        while let Some(event) = self.timing.pop_due_event() {
            let late = self.timing.ticks() - event.time;
            trace!("fire {} (userdata {:#X}, {} cycles late)", self.timing.event_name(event.event_type), event.userdata, late);

            let mut callback = self.timing.take_callback(event.event_type);
            callback(self, event.userdata, late);
            self.timing.restore_callback(event.event_type, callback);
        }
        self.timing.start_slice();
    }

    pub fn idle(&mut self) {
        self.timing.idle();
    }

    pub fn timing(&self) -> &Timing {
        &self.timing
    }

    pub fn timing_mut(&mut self) -> &mut Timing {
        &mut self.timing
    }

    pub fn register_event(&mut self, name: &str, callback: TimedCallback) -> EventType {
        self.timing.register_event(name, callback)
    }

    pub fn schedule_event(&mut self, cycles_into_future: u64, event_type: EventType, userdata: u64) {
        self.timing.schedule_event(cycles_into_future, event_type, userdata)
    }

    pub fn remove_event(&mut self, event_type: EventType, userdata: u64) {
        self.timing.remove_event(event_type, userdata)
    }

    pub fn system_tick(&self) -> u64 {
        self.timing.ticks()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn conversions_use_arm11_clock() {
        assert_eq!(ns_to_cycles(1_000_000_000), BASE_CLOCK_RATE_ARM11);
        assert_eq!(cycles_to_ns(BASE_CLOCK_RATE_ARM11), 1_000_000_000);
        assert_eq!(ns_to_cycles(0), 0);
        assert_eq!(ms_to_cycles(1), 268_111);
    }

    #[test]
    fn idle_fast_forwards_to_next_event() {
        let mut timing = Timing::new(MAX_SLICE_LENGTH);
        let event = timing.register_event("test", Box::new(|_, _, _| {}));
        timing.schedule_event(1234, event, 0);
        timing.idle();
        assert_eq!(timing.ticks(), 1234);
        assert_eq!(timing.pop_due_event().map(|e| e.time), Some(1234));
    }

    #[test]
    fn idle_without_events_ends_slice() {
        let mut timing = Timing::new(100);
        timing.add_ticks(30);
        timing.idle();
        assert_eq!(timing.ticks(), 100);
    }

    #[test]
    fn schedule_shortens_slice() {
        let mut timing = Timing::new(MAX_SLICE_LENGTH);
        let event = timing.register_event("short", Box::new(|_, _, _| {}));
        timing.start_slice();
        timing.schedule_event(500, event, 1);
        assert_eq!(timing.downcount(), 500);
    }

    #[test]
    fn remove_event_without_match_is_noop() {
        let mut timing = Timing::new(MAX_SLICE_LENGTH);
        let event = timing.register_event("a", Box::new(|_, _, _| {}));
        timing.schedule_event(10, event, 1);
        timing.remove_event(event, 2);
        assert_eq!(timing.pending_events(), 1);
        timing.remove_event(event, 1);
        assert_eq!(timing.pending_events(), 0);
    }

    #[test]
    #[should_panic]
    fn duplicate_names_panic() {
        let mut timing = Timing::new(MAX_SLICE_LENGTH);
        timing.register_event("dup", Box::new(|_, _, _| {}));
        timing.register_event("dup", Box::new(|_, _, _| {}));
    }

    #[test]
    fn same_time_events_fire_in_schedule_order_across_types() {
        let mut timing = Timing::new(MAX_SLICE_LENGTH);
        let first = timing.register_event("first", Box::new(|_, _, _| {}));
        let second = timing.register_event("second", Box::new(|_, _, _| {}));
        timing.schedule_event(40, second, 1);
        timing.schedule_event(40, first, 2);
        timing.schedule_event(10, second, 3);
        timing.add_ticks(40);

        let fired: Vec<(EventType, u64)> = std::iter::from_fn(|| timing.pop_due_event())
            .map(|e| (e.event_type, e.userdata))
            .collect();
        assert_eq!(fired, vec![(second, 3), (second, 1), (first, 2)]);
    }

    proptest! {
        #[test]
        fn events_pop_in_time_then_fifo_order(delays in proptest::collection::vec(0u64..50, 1..64)) {
            let mut timing = Timing::new(MAX_SLICE_LENGTH);
            let event = timing.register_event("ordered", Box::new(|_, _, _| {}));
            for (index, delay) in delays.iter().enumerate() {
                timing.schedule_event(*delay, event, index as u64);
            }
            timing.add_ticks(100);

            let mut fired = vec![];
            while let Some(e) = timing.pop_due_event() {
                fired.push((e.time, e.userdata));
            }

            let mut expected: Vec<(u64, u64)> = delays.iter().enumerate()
                .map(|(index, delay)| (*delay, index as u64))
                .collect();
            expected.sort();
            prop_assert_eq!(fired, expected);
        }
    }
}
