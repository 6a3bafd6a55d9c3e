//! Fixed-capacity buffer pool standing in for the capture pipeline's arena

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use crossbeam::utils::CachePadded;
use tracing::warn;

/// Lease on one pool slot. The generation distinguishes successive leases
/// of the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolTicket {
    pub slot: u32,
    pub generation: u32,
}

/// Owner of the storage behind [`PooledStorage`] leases.
pub trait BufferPool: Send + Sync {
    /// Take back a slot. Called exactly once per lease.
    fn recycle(&self, ticket: PoolTicket);
}

/// Pixel storage leased from a [`BufferPool`]. Dropping it recycles the
/// lease.
pub struct PooledStorage {
    ticket: PoolTicket,
    data: Bytes,
    pool: Arc<dyn BufferPool>,
}

impl PooledStorage {
    pub fn new(ticket: PoolTicket, data: Bytes, pool: Arc<dyn BufferPool>) -> Self {
        Self { ticket, data, pool }
    }

    pub fn ticket(&self) -> PoolTicket {
        self.ticket
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledStorage {
    fn drop(&mut self) {
        self.data = Bytes::new();
        self.pool.recycle(self.ticket);
    }
}

impl fmt::Debug for PooledStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledStorage")
            .field("ticket", &self.ticket)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub acquired: u64,
    pub recycled: u64,
    /// Recycles of a ticket that was already returned.
    pub double_recycles: u64,
    /// `acquire` calls that found no free slot.
    pub exhausted: u64,
}

impl PoolStats {
    pub fn outstanding(&self) -> u64 {
        self.acquired.saturating_sub(self.recycled)
    }
}

#[derive(Default)]
struct Counters {
    acquired: AtomicU64,
    recycled: AtomicU64,
    double_recycles: AtomicU64,
    exhausted: AtomicU64,
}

/// Heap-backed pool of equally sized frame slots.
///
/// Each slot's storage is allocated once; leases hand out cheap
/// reference-counted views of it. A slot's lease generation is zero while
/// the slot is free, which is how a second recycle of the same ticket is
/// detected and counted instead of corrupting the free list.
pub struct HeapPool {
    slots: Box<[Bytes]>,
    leases: Box<[CachePadded<AtomicU32>]>,
    free: ArrayQueue<u32>,
    next_generation: AtomicU32,
    stats: CachePadded<Counters>,
}

impl HeapPool {
    /// Pool of `capacity` zeroed slots of `slot_len` bytes.
    pub fn new(capacity: usize, slot_len: usize) -> Arc<Self> {
        Self::with_fill(capacity, slot_len, |_, _| {})
    }

    /// Pool whose slots are initialised by `fill(slot_index, bytes)`.
    pub fn with_fill(
        capacity: usize,
        slot_len: usize,
        mut fill: impl FnMut(usize, &mut [u8]),
    ) -> Arc<Self> {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|slot| {
                let mut buf = vec![0u8; slot_len];
                fill(slot, &mut buf);
                Bytes::from(buf)
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let free = ArrayQueue::new(capacity);
        for slot in 0..capacity as u32 {
            // Queue was sized for exactly this many slots.
            let _ = free.push(slot);
        }

        Arc::new(Self {
            slots,
            leases: (0..capacity)
                .map(|_| CachePadded::new(AtomicU32::new(0)))
                .collect(),
            free,
            next_generation: AtomicU32::new(1),
            stats: CachePadded::new(Counters::default()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Lease a slot's own storage, or `None` if every slot is out.
    pub fn acquire(self: &Arc<Self>) -> Option<PooledStorage> {
        let (ticket, slot) = self.lease()?;
        let data = self.slots[slot].clone();
        Some(PooledStorage::new(ticket, data, self.clone()))
    }

    /// Lease a slot but back it with caller-supplied bytes.
    pub fn acquire_with(self: &Arc<Self>, data: Bytes) -> Option<PooledStorage> {
        let (ticket, _) = self.lease()?;
        Some(PooledStorage::new(ticket, data, self.clone()))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.capacity(),
            acquired: self.stats.acquired.load(Ordering::Acquire),
            recycled: self.stats.recycled.load(Ordering::Acquire),
            double_recycles: self.stats.double_recycles.load(Ordering::Acquire),
            exhausted: self.stats.exhausted.load(Ordering::Acquire),
        }
    }

    fn lease(&self) -> Option<(PoolTicket, usize)> {
        let Some(slot) = self.free.pop() else {
            self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let mut generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        if generation == 0 {
            generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        }
        self.leases[slot as usize].store(generation, Ordering::Release);
        self.stats.acquired.fetch_add(1, Ordering::AcqRel);

        Some((PoolTicket { slot, generation }, slot as usize))
    }
}

impl BufferPool for HeapPool {
    fn recycle(&self, ticket: PoolTicket) {
        let Some(lease) = self.leases.get(ticket.slot as usize) else {
            warn!(?ticket, "recycle of a ticket from another pool");
            self.stats.double_recycles.fetch_add(1, Ordering::AcqRel);
            return;
        };

        if lease
            .compare_exchange(ticket.generation, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(?ticket, "buffer recycled twice");
            self.stats.double_recycles.fetch_add(1, Ordering::AcqRel);
            return;
        }

        self.stats.recycled.fetch_add(1, Ordering::AcqRel);
        let _ = self.free.push(ticket.slot);
    }
}
