// Buffer cache.
//
// A fixed set of 64 slots caches recently used sectors in memory, so
// that repeated byte-range reads and writes do not each cost a device
// transfer. Slots are recycled least-recently-used first; dirty slots
// are written back when evicted or on flush().
//
// Interface:
// * read(sector, dst, offset) / write(sector, src, offset) move bytes
//   between a caller buffer and the cached copy of a sector.
// * A full-sector write is "blind": an evicted slot is rebound to the
//   sector without filling it from the device first, since the caller
//   is about to overwrite every byte.
// * flush() writes all dirty slots back without invalidating them.
//
// One mutex guards the whole slot table. Device I/O happens with the
// mutex released and the slot marked not-ready; anyone who finds a
// not-ready slot waits on that slot's condvar. Because any slot can
// change hands while the mutex is down, every helper that re-acquires
// it re-validates slot state by re-running the lookup loop.

use crate::block::BlockDevice;
use crate::param::{CACHE_SLOTS, INVALID_SECTOR, SECTOR_SIZE};
use array_macro::array;
use log::debug;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

struct Slot {
    sector: u32,
    data: [u8; SECTOR_SIZE],
    ready: bool,
    dirty: bool,
}

impl Slot {
    const fn new() -> Self {
        Self {
            sector: INVALID_SECTOR,
            data: [0; SECTOR_SIZE],
            ready: true,
            dirty: false,
        }
    }
}

struct CacheState {
    slots: [Slot; CACHE_SLOTS],
    // Slot indices ordered most-recently-used first; a permutation of
    // 0..CACHE_SLOTS.
    lru: Vec<usize>,
    hits: u64,
    accesses: u64,
    device_writes: u64,
}

pub struct BufCache {
    dev: Arc<dyn BlockDevice>,
    state: Mutex<CacheState>,
    slot_ready: [Condvar; CACHE_SLOTS],
    any_ready: Condvar,
}

impl BufCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            state: Mutex::new(CacheState {
                slots: array![_ => Slot::new(); CACHE_SLOTS],
                lru: (0..CACHE_SLOTS).collect(),
                hits: 0,
                accesses: 0,
                device_writes: 0,
            }),
            slot_ready: array![_ => Condvar::new(); CACHE_SLOTS],
            any_ready: Condvar::new(),
        }
    }

    /// Copy `dst.len()` bytes starting at `offset` within `sector` into
    /// `dst`.
    pub fn read(&self, sector: u32, dst: &mut [u8], offset: usize) {
        assert!(offset + dst.len() <= SECTOR_SIZE);
        let guard = self.state.lock().unwrap();
        let (mut guard, i) = self.access(guard, sector, false);
        guard.accesses += 1;
        dst.copy_from_slice(&guard.slots[i].data[offset..offset + dst.len()]);
    }

    /// Copy `src` into `sector` at `offset` and mark the slot dirty.
    pub fn write(&self, sector: u32, src: &[u8], offset: usize) {
        assert!(offset + src.len() <= SECTOR_SIZE);
        let blind = src.len() == SECTOR_SIZE;
        let guard = self.state.lock().unwrap();
        let (mut guard, i) = self.access(guard, sector, blind);
        guard.slots[i].data[offset..offset + src.len()].copy_from_slice(src);
        guard.accesses += 1;
        guard.slots[i].dirty = true;
    }

    /// Find the slot holding `sector`, loading or evicting as needed.
    /// Returns with the slot ready and moved to the LRU front.
    fn access<'a>(
        &'a self,
        mut guard: MutexGuard<'a, CacheState>,
        sector: u32,
        blind: bool,
    ) -> (MutexGuard<'a, CacheState>, usize) {
        loop {
            if let Some(i) = guard.slots.iter().position(|s| s.sector == sector) {
                if !guard.slots[i].ready {
                    guard = self.slot_ready[i].wait(guard).unwrap();
                    continue;
                }
                guard.hits += 1;
                let at = guard.lru.iter().position(|&s| s == i).unwrap();
                guard.lru.remove(at);
                guard.lru.insert(0, i);
                return (guard, i);
            }
            // Miss: evict the least recently used ready slot. Each arm
            // loops back so the find above re-validates whatever
            // happened while the lock was down.
            match eviction_candidate(&*guard) {
                None => guard = self.any_ready.wait(guard).unwrap(),
                Some(victim) if guard.slots[victim].dirty => {
                    guard = self.clean(guard, victim);
                }
                Some(victim) if blind => {
                    // Rebind without filling from the device; the
                    // caller is about to overwrite the whole page.
                    debug!(
                        "cache: blind rebind slot {} {} -> {}",
                        victim, guard.slots[victim].sector, sector
                    );
                    guard.slots[victim].sector = sector;
                }
                Some(victim) => guard = self.replace(guard, victim, sector),
            }
        }
    }

    /// Write a dirty, ready slot back to the device.
    fn clean<'a>(
        &'a self,
        mut guard: MutexGuard<'a, CacheState>,
        i: usize,
    ) -> MutexGuard<'a, CacheState> {
        assert!(guard.slots[i].dirty);
        assert!(guard.slots[i].ready);
        guard.slots[i].ready = false;
        let sector = guard.slots[i].sector;
        let page = guard.slots[i].data;
        drop(guard);
        debug!("cache: write back sector {}", sector);
        self.dev.write_sector(sector, &page);
        let mut guard = self.state.lock().unwrap();
        guard.accesses += 1;
        guard.device_writes += 1;
        guard.slots[i].ready = true;
        guard.slots[i].dirty = false;
        self.slot_ready[i].notify_all();
        self.any_ready.notify_all();
        guard
    }

    /// Rebind a clean, ready slot to `sector` and fill it from the
    /// device. The new binding is published before the lock is dropped
    /// so concurrent lookups of `sector` wait instead of double-loading.
    fn replace<'a>(
        &'a self,
        mut guard: MutexGuard<'a, CacheState>,
        i: usize,
        sector: u32,
    ) -> MutexGuard<'a, CacheState> {
        assert!(!guard.slots[i].dirty);
        guard.slots[i].sector = sector;
        guard.slots[i].ready = false;
        drop(guard);
        let mut page = [0u8; SECTOR_SIZE];
        self.dev.read_sector(sector, &mut page);
        let mut guard = self.state.lock().unwrap();
        guard.slots[i].data = page;
        guard.accesses += 1;
        guard.slots[i].ready = true;
        self.slot_ready[i].notify_all();
        self.any_ready.notify_all();
        guard
    }

    /// Write every dirty slot back to the device. Slots stay bound.
    pub fn flush(&self) {
        let mut guard = self.state.lock().unwrap();
        for i in 0..CACHE_SLOTS {
            // A slot mid-I/O may still be flagged dirty; wait for its
            // owner rather than racing it to the device.
            while guard.slots[i].dirty {
                if !guard.slots[i].ready {
                    guard = self.slot_ready[i].wait(guard).unwrap();
                } else {
                    guard = self.clean(guard, i);
                }
            }
        }
    }

    /// Flush, then zero the hit/access/write counters.
    pub fn reset_stats(&self) {
        self.flush();
        let mut guard = self.state.lock().unwrap();
        guard.hits = 0;
        guard.accesses = 0;
        guard.device_writes = 0;
    }

    /// Integer percentage of accesses served from the cache. 0 before
    /// any access has been recorded.
    pub fn hit_rate(&self) -> u64 {
        let guard = self.state.lock().unwrap();
        if guard.accesses == 0 {
            return 0;
        }
        guard.hits * 100 / guard.accesses
    }

    /// Sector writes issued to the device since init or reset_stats().
    pub fn device_writes(&self) -> u64 {
        self.state.lock().unwrap().device_writes
    }
}

/// The slot closest to the LRU tail that is not mid-I/O, if any.
fn eviction_candidate(state: &CacheState) -> Option<usize> {
    state
        .lru
        .iter()
        .rev()
        .copied()
        .find(|&i| state.slots[i].ready)
}
