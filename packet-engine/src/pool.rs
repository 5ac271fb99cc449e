//! Free-list of fixed-MTU packets.
//!
//! Every [`Packet`] the engine touches is borrowed from a [`PacketPool`] and
//! moved back into it when done, so a packet is owned by exactly one place
//! at a time: pool → engine worker → pool.
//!
//! The pool shrinks itself: a returned packet is dropped instead of kept
//! whenever the free list already holds more than half as many packets as
//! are currently lent out, and the free list is trimmed back to
//! `used / 2 + 1` as usage falls. Idle memory therefore stays bounded well
//! below the high-water mark, while a buffer that is likely to be reused
//! soon is kept.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::packet::{Packet, PacketId};

/// Counters describing the pool at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Packets currently lent out.
    pub used: usize,
    /// Clean packets waiting on the free list.
    pub free: usize,
    /// Packets created over the pool's lifetime.
    pub allocated: u64,
    /// Packets dropped by the shrink policy.
    pub released: u64,
    /// Highest `used` value seen.
    pub high_water: usize,
}

struct PoolInner {
    free_list: Vec<Packet>,
    lent: HashSet<PacketId>,
    next_id: u32,
    allocated: u64,
    released: u64,
    high_water: usize,
}

/// Mutex-guarded pool of packets that all share one MTU.
pub struct PacketPool {
    mtu: usize,
    inner: Mutex<PoolInner>,
}

impl PacketPool {
    /// Create a pool whose packets all have `mtu`-byte buffers.
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu,
            inner: Mutex::new(PoolInner {
                free_list: Vec::new(),
                lent: HashSet::new(),
                next_id: 1,
                allocated: 0,
                released: 0,
                high_water: 0,
            }),
        }
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrow a clean packet, allocating one if the free list is empty.
    pub fn get_packet(&self) -> Packet {
        let id = {
            let mut inner = self.lock();
            if let Some(p) = inner.free_list.pop() {
                inner.lent.insert(p.id());
                inner.high_water = inner.high_water.max(inner.lent.len());
                return p;
            }
            let id = PacketId(inner.next_id);
            // Id 0 is reserved for detached packets.
            inner.next_id = inner.next_id.checked_add(1).unwrap_or(1);
            inner.allocated += 1;
            inner.lent.insert(id);
            inner.high_water = inner.high_water.max(inner.lent.len());
            id
        };
        // Allocation happens outside the lock.
        Packet::with_id(id, self.mtu)
    }

    /// Give a packet back.
    ///
    /// Packets that were not lent by this pool are dropped and logged.
    pub fn return_packet(&self, mut p: Packet) {
        let mut inner = self.lock();
        if !inner.lent.remove(&p.id()) {
            drop(inner);
            log::warn!("[pool] dropping foreign packet {:?}", p.id());
            return;
        }
        let used = inner.lent.len();
        let mut excess = Vec::new();
        if inner.free_list.len() * 2 > used {
            inner.released += 1;
            excess.push(p);
        } else {
            p.clean();
            inner.free_list.push(p);
        }
        // Trim what an earlier, busier period left behind.
        let limit = used / 2 + 1;
        while inner.free_list.len() > limit {
            if let Some(extra) = inner.free_list.pop() {
                inner.released += 1;
                excess.push(extra);
            }
        }
        drop(inner);
        if !excess.is_empty() {
            log::trace!("[pool] shrink: releasing {} packet(s)", excess.len());
        }
    }

    /// Number of packets currently lent out.
    pub fn used_count(&self) -> usize {
        self.lock().lent.len()
    }

    /// Number of clean packets on the free list.
    pub fn free_count(&self) -> usize {
        self.lock().free_list.len()
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.lock();
        PoolStats {
            used: inner.lent.len(),
            free: inner.free_list.len(),
            allocated: inner.allocated,
            released: inner.released,
            high_water: inner.high_water,
        }
    }
}

impl std::fmt::Debug for PacketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketPool")
            .field("mtu", &self.mtu)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn packets_share_the_pool_mtu() {
        let pool = PacketPool::new(128);
        let p = pool.get_packet();
        assert_eq!(p.mtu(), 128);
        assert_eq!(pool.used_count(), 1);
        pool.return_packet(p);
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn returned_packet_is_clean_and_reused() {
        let pool = PacketPool::new(64);
        let keep = pool.get_packet();
        let mut p = pool.get_packet();
        p.chan_id = 9;
        p.set_payload(b"dirty");
        p.send_attempts = 3;
        let id = p.id();
        pool.return_packet(p);
        assert_eq!(pool.free_count(), 1);

        let again = pool.get_packet();
        assert_eq!(again.id(), id);
        assert_eq!(again.chan_id, 0);
        assert_eq!(again.payload_len(), 0);
        assert_eq!(again.send_attempts, 0);
        pool.return_packet(again);
        pool.return_packet(keep);
    }

    #[test]
    fn shrink_keeps_free_list_at_most_half_of_used() {
        let pool = PacketPool::new(32);
        let held: Vec<Packet> = (0..10).map(|_| pool.get_packet()).collect();
        for p in held {
            pool.return_packet(p);
        }
        let stats = pool.stats();
        assert_eq!(stats.used, 0);
        assert!(stats.free <= 1, "free list grew to {}", stats.free);
        assert_eq!(stats.allocated, 10);
        assert_eq!(stats.high_water, 10);
        assert_eq!(stats.released as usize + stats.free, 10);
    }

    #[test]
    fn foreign_packet_is_not_adopted() {
        let pool = PacketPool::new(32);
        pool.return_packet(Packet::new(32));
        assert_eq!(pool.free_count(), 0);
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn random_get_return_sequences_respect_the_bound() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let pool = PacketPool::new(32);
        let mut held: Vec<Packet> = Vec::new();
        let mut peak_used = 0usize;

        for _ in 0..10_000 {
            if held.is_empty() || rng.random_bool(0.55) {
                held.push(pool.get_packet());
            } else {
                let i = rng.random_range(0..held.len());
                pool.return_packet(held.swap_remove(i));
            }
            let stats = pool.stats();
            peak_used = peak_used.max(stats.used);
            assert_eq!(stats.used, held.len());
            assert!(stats.free <= peak_used / 2 + 1);
        }
        for p in held.drain(..) {
            pool.return_packet(p);
        }
        assert_eq!(pool.used_count(), 0);
    }
}
