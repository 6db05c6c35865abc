//! Hashed-Bucket Deadline Scheduler
//!
//! Timers live in an arena of slots. Active slots are threaded onto one of
//! [`BUCKETS`] doubly linked lists chosen by hashing the deadline; each list
//! is kept sorted by deadline. Freed slots go onto a free list and are reused,
//! with a generation counter so stale handles can never touch the new owner.
//!
//! ```text
//!   buckets[0]  ──► [t=105] ⇄ [t=172] ⇄ [t=239]
//!   buckets[1]  ──► [t=  1]
//!   ...
//!   buckets[66] ──► (empty)
//!
//!   free ──► slot 4 ──► slot 9 ──► None
//! ```
//!
//! Insertion only walks its own bucket. Because deadlines are not ordered
//! across buckets, finding the earliest timer looks at every bucket head.

use std::time::{Duration, Instant};

/// Number of deadline buckets.
pub const BUCKETS: usize = 67;

/// Smallest period a periodic timer may have.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Identifies a scheduled timer. Stays valid until the timer fires (one-shot)
/// or is canceled; afterwards every operation on it is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    index: usize,
    generation: u32,
}

/// A timer that came due, handed back by [`Scheduler::next_expired`].
#[derive(Debug, Clone)]
pub struct Expired<T> {
    pub handle: TimerHandle,
    pub deadline: Instant,
    pub data: T,
    /// Whether the timer is still scheduled (periodic timers).
    pub rescheduled: bool,
}

/// Slot counts for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub active: usize,
    pub free: usize,
    pub allocated: usize,
}

#[derive(Debug)]
struct Timer<T> {
    deadline: Instant,
    period: Duration,
    periodic: bool,
    data: T,
    bucket: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    timer: Option<Timer<T>>,
    next_free: Option<usize>,
}

/// Deadline scheduler carrying a payload of type `T` per timer.
#[derive(Debug)]
pub struct Scheduler<T> {
    slots: Vec<Slot<T>>,
    buckets: [Option<usize>; BUCKETS],
    free_head: Option<usize>,
    origin: Instant,
    active: usize,
}

impl<T: Clone> Scheduler<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            buckets: [None; BUCKETS],
            free_head: None,
            origin: Instant::now(),
            active: 0,
        }
    }

    /// Drops every scheduled timer and all pooled slots.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.buckets = [None; BUCKETS];
        self.free_head = None;
        self.active = 0;
    }

    /// Number of active timers.
    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    fn hash(&self, deadline: Instant) -> usize {
        let ms = deadline.saturating_duration_since(self.origin).as_millis();
        (ms % BUCKETS as u128) as usize
    }

    fn node(&self, idx: usize) -> Option<&Timer<T>> {
        self.slots.get(idx).and_then(|s| s.timer.as_ref())
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Timer<T>> {
        self.slots.get_mut(idx).and_then(|s| s.timer.as_mut())
    }

    fn resolve(&self, handle: TimerHandle) -> Option<usize> {
        self.slots
            .get(handle.index)
            .filter(|s| s.generation == handle.generation && s.timer.is_some())
            .map(|_| handle.index)
    }

    /// Schedules a timer due at `base + period`. A `None` base means now.
    pub fn schedule(
        &mut self,
        base: Option<Instant>,
        period: Duration,
        periodic: bool,
        data: T,
    ) -> TimerHandle {
        let period = if periodic { period.max(MIN_PERIOD) } else { period };
        let deadline = base.unwrap_or_else(Instant::now) + period;

        let timer = Timer {
            deadline,
            period,
            periodic,
            data,
            bucket: 0,
            prev: None,
            next: None,
        };

        let index = match self.free_head {
            Some(idx) => {
                let slot = &mut self.slots[idx];
                self.free_head = slot.next_free.take();
                slot.timer = Some(timer);
                idx
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    timer: Some(timer),
                    next_free: None,
                });
                self.slots.len() - 1
            }
        };

        self.active += 1;
        self.link(index);

        TimerHandle {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Inserts `idx` into its bucket after any timers with an equal or
    /// earlier deadline.
    fn link(&mut self, idx: usize) {
        let Some(deadline) = self.node(idx).map(|t| t.deadline) else {
            return;
        };
        let bucket = self.hash(deadline);

        let mut prev = None;
        let mut cursor = self.buckets[bucket];
        while let Some(c) = cursor {
            match self.node(c) {
                Some(t) if t.deadline <= deadline => {
                    prev = Some(c);
                    cursor = t.next;
                }
                _ => break,
            }
        }

        if let Some(t) = self.node_mut(idx) {
            t.bucket = bucket;
            t.prev = prev;
            t.next = cursor;
        }
        match prev {
            Some(p) => {
                if let Some(t) = self.node_mut(p) {
                    t.next = Some(idx);
                }
            }
            None => self.buckets[bucket] = Some(idx),
        }
        if let Some(n) = cursor {
            if let Some(t) = self.node_mut(n) {
                t.prev = Some(idx);
            }
        }
    }

    fn unlink(&mut self, idx: usize) {
        let Some((bucket, prev, next)) = self.node(idx).map(|t| (t.bucket, t.prev, t.next)) else {
            return;
        };

        match prev {
            Some(p) => {
                if let Some(t) = self.node_mut(p) {
                    t.next = next;
                }
            }
            None => self.buckets[bucket] = next,
        }
        if let Some(n) = next {
            if let Some(t) = self.node_mut(n) {
                t.prev = prev;
            }
        }
        if let Some(t) = self.node_mut(idx) {
            t.prev = None;
            t.next = None;
        }
    }

    /// Moves an unlinked slot to the free list and returns its timer.
    fn release(&mut self, idx: usize) -> Option<Timer<T>> {
        let slot = &mut self.slots[idx];
        let timer = slot.timer.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.free_head;
        self.free_head = Some(idx);
        self.active -= 1;
        Some(timer)
    }

    /// Cancels a timer. Returns false if it had already fired or been
    /// canceled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        let Some(idx) = self.resolve(handle) else {
            return false;
        };
        self.unlink(idx);
        self.release(idx).is_some()
    }

    /// Re-arms an active timer to fire one period after `now`.
    pub fn reset(&mut self, handle: TimerHandle, now: Instant) -> bool {
        let Some(idx) = self.resolve(handle) else {
            return false;
        };
        self.unlink(idx);
        if let Some(t) = self.node_mut(idx) {
            t.deadline = now + t.period;
        }
        self.link(idx);
        true
    }

    pub fn is_active(&self, handle: TimerHandle) -> bool {
        self.resolve(handle).is_some()
    }

    /// Current deadline of an active timer.
    pub fn deadline(&self, handle: TimerHandle) -> Option<Instant> {
        self.resolve(handle)
            .and_then(|idx| self.node(idx))
            .map(|t| t.deadline)
    }

    /// Earliest active timer across all buckets.
    fn earliest(&self) -> Option<(usize, Instant)> {
        self.buckets
            .iter()
            .filter_map(|head| head.and_then(|idx| self.node(idx).map(|t| (idx, t.deadline))))
            .min_by_key(|&(_, deadline)| deadline)
    }

    /// How long until the next deadline. `Some(ZERO)` if something is already
    /// due, `None` if nothing is scheduled.
    pub fn earliest_wait(&self, now: Instant) -> Option<Duration> {
        self.earliest()
            .map(|(_, deadline)| deadline.saturating_duration_since(now))
    }

    /// Pops the earliest timer due at `now`, if any.
    ///
    /// One-shot timers are released. Periodic timers are moved forward by
    /// exactly one period from their previous deadline and stay scheduled.
    pub fn next_expired(&mut self, now: Instant) -> Option<Expired<T>> {
        let (idx, deadline) = self.earliest().filter(|&(_, d)| d <= now)?;
        let handle = TimerHandle {
            index: idx,
            generation: self.slots[idx].generation,
        };

        self.unlink(idx);

        let periodic = self.node(idx).is_some_and(|t| t.periodic);
        if periodic {
            let data = {
                let t = self.node_mut(idx)?;
                t.deadline += t.period;
                t.data.clone()
            };
            self.link(idx);
            return Some(Expired {
                handle,
                deadline,
                data,
                rescheduled: true,
            });
        }

        let timer = self.release(idx)?;
        Some(Expired {
            handle,
            deadline,
            data: timer.data,
            rescheduled: false,
        })
    }

    /// Fires every timer due at `now` in deadline order. Returns how many
    /// fired.
    pub fn run_due<F>(&mut self, now: Instant, mut fire: F) -> usize
    where
        F: FnMut(TimerHandle, T),
    {
        let mut fired = 0;
        while let Some(expired) = self.next_expired(now) {
            fire(expired.handle, expired.data);
            fired += 1;
        }
        fired
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            active: self.active,
            free: self.slots.len() - self.active,
            allocated: self.slots.len(),
        }
    }
}

impl<T: Clone> Default for Scheduler<T> {
    fn default() -> Self {
        Self::new()
    }
}
