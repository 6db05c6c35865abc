//! Fixed-capacity connection pool.
//!
//! Slots are allocated once at startup and linked into an index-based free
//! list. Accepting takes the head of the list; closing prepends the slot
//! again. Each slot keeps its buffers between connections and carries a
//! generation counter so a [`ConnId`] held by a timer cannot reach a later
//! occupant of the same slot.

use super::handler::{Buffers, Connection};
use super::ConnState;
use std::fmt;

/// Identifies one connection in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId {
    index: usize,
    generation: u32,
}

impl ConnId {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    conn: Option<Connection>,
    buffers: Option<Buffers>,
    next_free: Option<usize>,
}

/// The connection table.
#[derive(Debug)]
pub struct ConnectionPool {
    slots: Vec<Slot>,
    free_head: Option<usize>,
    active: usize,
    high_water: usize,
}

impl ConnectionPool {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|i| Slot {
                generation: 0,
                conn: None,
                buffers: None,
                next_free: (i + 1 < capacity).then_some(i + 1),
            })
            .collect();

        Self {
            slots,
            free_head: (capacity > 0).then_some(0),
            active: 0,
            high_water: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of connections in use.
    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    pub fn is_full(&self) -> bool {
        self.free_head.is_none()
    }

    /// Most connections ever in use at once.
    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// Takes the first free slot and fills it with the connection built by
    /// `make`, which receives the slot's retained buffers. Returns `None`
    /// when the pool is full.
    pub fn insert_with<F>(&mut self, make: F) -> Option<ConnId>
    where
        F: FnOnce(Buffers) -> Connection,
    {
        let index = self.free_head?;
        let slot = &mut self.slots[index];
        self.free_head = slot.next_free.take();

        let buffers = slot.buffers.take().unwrap_or_else(Buffers::new);
        slot.conn = Some(make(buffers));

        self.active += 1;
        self.high_water = self.high_water.max(self.active);

        Some(ConnId {
            index,
            generation: slot.generation,
        })
    }

    fn slot(&self, id: ConnId) -> Option<&Slot> {
        self.slots
            .get(id.index)
            .filter(|s| s.generation == id.generation)
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slot(id).and_then(|s| s.conn.as_ref())
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.conn.as_mut())
    }

    /// The id of whatever occupies slot `index`, if anything.
    pub fn id_at(&self, index: usize) -> Option<ConnId> {
        let slot = self.slots.get(index)?;
        slot.conn.as_ref().map(|_| ConnId {
            index,
            generation: slot.generation,
        })
    }

    /// State of the connection in slot `index`; empty slots are `Free`.
    pub fn state_at(&self, index: usize) -> ConnState {
        self.slots
            .get(index)
            .and_then(|s| s.conn.as_ref())
            .map_or(ConnState::Free, |c| c.state)
    }

    /// Ids of every connection in use, in slot order.
    pub fn ids(&self) -> Vec<ConnId> {
        (0..self.slots.len())
            .filter_map(|i| self.id_at(i))
            .collect()
    }

    /// Removes a connection and returns its slot to the free list. The
    /// caller is responsible for timers and multiplexer registration.
    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        let slot = self
            .slots
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation)?;
        let mut conn = slot.conn.take()?;
        conn.state = ConnState::Free;

        slot.generation = slot.generation.wrapping_add(1);
        slot.next_free = self.free_head;
        self.free_head = Some(id.index);
        self.active -= 1;
        Some(conn)
    }

    /// Hands a closed connection's buffers back to slot `index` for reuse.
    pub fn recycle(&mut self, index: usize, buffers: Buffers) {
        if let Some(slot) = self.slots.get_mut(index) {
            if slot.conn.is_none() {
                slot.buffers = Some(buffers);
            }
        }
    }
}
