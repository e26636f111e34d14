//! Fixed-slot indirection table for in-flight receive contexts.
//!
//! RDMA immediates are 32 bits, so receive-buffer descriptors cannot be
//! addressed by pointer across the wire. The pool hands out stable slot
//! indices instead; the peer echoes an index back as the immediate of
//! its write.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Number of slots. Bounds the in-flight receive descriptors per van.
const POOL_ENTRIES: usize = 512;

struct Inner<T> {
    free: VecDeque<u32>,
    table: Vec<Option<Arc<T>>>,
}

/// Thread-safe table mapping a 32-bit slot index to a shared descriptor.
pub(crate) struct AddressPool<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> AddressPool<T> {
    pub fn new() -> Self {
        let mut inner = Inner {
            free: VecDeque::with_capacity(POOL_ENTRIES),
            table: Vec::with_capacity(POOL_ENTRIES),
        };
        for i in 0..POOL_ENTRIES {
            inner.free.push_back(i as u32);
            inner.table.push(None);
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Store a descriptor, returning its slot index.
    ///
    /// # Panics
    ///
    /// Panic if all slots are occupied.
    pub fn store(&self, value: Arc<T>) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner.free.pop_front().expect("address pool exhausted");
        debug_assert!(inner.table[idx as usize].is_none());
        inner.table[idx as usize] = Some(value);
        idx
    }

    /// Fetch the descriptor at `idx`, keeping the slot occupied.
    ///
    /// # Panics
    ///
    /// Panic if the slot is empty: the peer wrote an immediate we never
    /// handed out.
    pub fn get(&self, idx: u32) -> Arc<T> {
        let inner = self.inner.lock().unwrap();
        inner.table[idx as usize]
            .as_ref()
            .expect("empty address-pool slot")
            .clone()
    }

    /// Drop every descriptor and mark all slots free. Shutdown only.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        let Inner { free, table } = &mut *inner;
        for (i, slot) in table.iter_mut().enumerate() {
            if slot.take().is_some() {
                free.push_back(i as u32);
            }
        }
    }

    /// Release the slot at `idx`, returning its descriptor.
    ///
    /// # Panics
    ///
    /// Panic on double release.
    pub fn release(&self, idx: u32) -> Arc<T> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.table[idx as usize]
            .take()
            .expect("double release of address-pool slot");
        inner.free.push_back(idx);
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn store_get_release() {
        let pool = AddressPool::new();
        let idx = pool.store(Arc::new(7usize));
        assert_eq!(*pool.get(idx), 7);
        assert_eq!(*pool.get(idx), 7);
        assert_eq!(*pool.release(idx), 7);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn double_release_faults() {
        let pool = AddressPool::new();
        let idx = pool.store(Arc::new(1u32));
        pool.release(idx);
        pool.release(idx);
    }

    #[test]
    fn full_capacity() {
        let pool = AddressPool::new();
        let indices: Vec<u32> = (0..POOL_ENTRIES).map(|i| pool.store(Arc::new(i))).collect();
        for (i, &idx) in indices.iter().enumerate() {
            assert_eq!(*pool.get(idx), i);
        }
        for &idx in &indices {
            pool.release(idx);
        }
        // All slots usable again.
        let idx = pool.store(Arc::new(0usize));
        pool.release(idx);
    }

    /// Random insert/release interleavings: indices stay stable, no slot
    /// is double-assigned, and no descriptor is lost.
    #[test]
    fn randomized_interleaving() {
        let pool = AddressPool::new();
        let mut rng = rand::thread_rng();
        let mut live: Vec<(u32, u64)> = Vec::new();
        let mut next_tag = 0u64;

        for _ in 0..10_000 {
            let do_store = live.is_empty() || (live.len() < POOL_ENTRIES && rng.gen_bool(0.5));
            if do_store {
                let tag = next_tag;
                next_tag += 1;
                let idx = pool.store(Arc::new(tag));
                assert!(
                    !live.iter().any(|&(i, _)| i == idx),
                    "slot {} double-assigned",
                    idx
                );
                live.push((idx, tag));
            } else {
                let at = rng.gen_range(0..live.len());
                let (idx, tag) = live.swap_remove(at);
                assert_eq!(*pool.get(idx), tag);
                assert_eq!(*pool.release(idx), tag);
            }
        }

        for (idx, tag) in live {
            assert_eq!(*pool.release(idx), tag);
        }
    }
}
