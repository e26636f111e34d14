//! Registered memory pools.
//!
//! Two separate concerns live here:
//!
//! - [`MemPool`]: a page-aligned size-class allocator over large slabs,
//!   each slab registered once so every small allocation shares the
//!   slab's `lkey`/`rkey` pair. Meta blocks, control-frame chunks and
//!   rendezvous receive buffers all come from here.
//! - [`MrCache`]: idempotent registration of *caller-owned* payload
//!   buffers that are not part of any pool. Keyed by start address;
//!   entries live until the van shuts down.

use std::collections::HashMap;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Mutex};

use ahash::RandomState;
use dashmap::DashMap;
use rdma_sys::*;

use crate::type_alias::*;
use crate::util::math::{page_size, roundup};
use crate::util::page_alloc::{alloc_slab, PageAlloc};

/// A party that takes allocations back. Implemented by the pools so a
/// [`PoolBuf`] can return itself on drop regardless of which backend
/// registered its slab.
pub(crate) trait BufReturn: Send + Sync {
    fn return_buf(&self, ptr: *mut u8);
}

/// An allocation handed out by a pool. Returns itself on drop.
pub(crate) struct PoolBuf {
    ptr: NonNull<u8>,
    len: usize,
    owner: Option<Arc<dyn BufReturn>>,
}

unsafe impl Send for PoolBuf {}
unsafe impl Sync for PoolBuf {}

impl PoolBuf {
    pub(crate) fn new(ptr: NonNull<u8>, len: usize, owner: Option<Arc<dyn BufReturn>>) -> Self {
        Self { ptr, len, owner }
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Rounded-up length actually reserved for this allocation.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.return_buf(self.ptr.as_ptr());
        }
    }
}

struct Slab {
    mem: PageAlloc,
    lkey: LKey,
    rkey: RKey,
    /// Carve offset of the next fresh allocation.
    bump: usize,
}

impl Slab {
    #[inline]
    fn contains(&self, addr: usize) -> bool {
        let start = self.mem.ptr as usize;
        (start..start + self.mem.len).contains(&addr)
    }
}

/// Size-class bookkeeping over raw slabs, separated from registration so
/// the logic is exercisable without a fabric.
pub(crate) struct PoolInner {
    slabs: Vec<Slab>,
    /// rounded size -> free block addresses
    free: HashMap<usize, Vec<usize>, RandomState>,
    /// live block address -> rounded size
    used: HashMap<usize, usize, RandomState>,
    next_slab_len: usize,
}

impl PoolInner {
    /// First slab size; grows by doubling on exhaustion.
    pub(crate) const INITIAL_SLAB_LEN: usize = 1 << 26;

    pub(crate) fn new() -> Self {
        Self {
            slabs: Vec::new(),
            free: HashMap::with_hasher(RandomState::new()),
            used: HashMap::with_hasher(RandomState::new()),
            next_slab_len: Self::INITIAL_SLAB_LEN,
        }
    }

    pub(crate) fn add_slab(&mut self, mem: PageAlloc, lkey: LKey, rkey: RKey) {
        self.slabs.push(Slab {
            mem,
            lkey,
            rkey,
            bump: 0,
        });
    }

    /// Length the next slab should have to satisfy an allocation of
    /// `len` rounded bytes.
    pub(crate) fn next_slab_len(&mut self, len: usize) -> usize {
        let want = self.next_slab_len.max(len);
        self.next_slab_len = (self.next_slab_len * 2).max(want);
        want
    }

    fn slab_of(&self, addr: usize) -> Option<&Slab> {
        self.slabs.iter().find(|s| s.contains(addr))
    }

    /// Allocate `len` bytes rounded up to page size, zeroed.
    /// Return `None` when every slab is exhausted.
    pub(crate) fn alloc(&mut self, len: usize) -> Option<(*mut u8, usize)> {
        let rounded = roundup(len.max(1), page_size());

        if let Some(list) = self.free.get_mut(&rounded) {
            if let Some(addr) = list.pop() {
                self.used.insert(addr, rounded);
                // Recycled blocks carry stale bytes.
                // SAFETY: `[addr, addr + rounded)` is inside a live slab.
                unsafe { ptr::write_bytes(addr as *mut u8, 0, rounded) };
                return Some((addr as *mut u8, rounded));
            }
        }

        let slab = self.slabs.last_mut()?;
        if slab.bump + rounded > slab.mem.len {
            return None;
        }
        let addr = slab.mem.ptr as usize + slab.bump;
        slab.bump += rounded;
        self.used.insert(addr, rounded);
        // Fresh slab memory is already zeroed.
        Some((addr as *mut u8, rounded))
    }

    /// Return a block to its size class.
    ///
    /// # Panics
    ///
    /// Panic if `ptr` was not produced by [`PoolInner::alloc`].
    pub(crate) fn free(&mut self, ptr: *mut u8) {
        let addr = ptr as usize;
        let rounded = self
            .used
            .remove(&addr)
            .expect("freeing a pointer not owned by this pool");
        self.free.entry(rounded).or_default().push(addr);
    }

    pub(crate) fn local_key(&self, ptr: *mut u8) -> LKey {
        self.slab_of(ptr as usize)
            .expect("pointer not covered by any slab")
            .lkey
    }

    pub(crate) fn remote_key(&self, ptr: *mut u8) -> RKey {
        self.slab_of(ptr as usize)
            .expect("pointer not covered by any slab")
            .rkey
    }
}

/// Verbs-backed memory pool. Slabs are registered against the van's PD
/// with local-write and remote-write access.
pub(crate) struct MemPool {
    pd: *mut ibv_pd,
    inner: Mutex<PoolInner>,
    mrs: Mutex<Vec<*mut ibv_mr>>,
}

unsafe impl Send for MemPool {}
unsafe impl Sync for MemPool {}

impl MemPool {
    pub fn new(pd: *mut ibv_pd) -> Arc<Self> {
        assert!(!pd.is_null(), "memory pool needs a protection domain");
        Arc::new(Self {
            pd,
            inner: Mutex::new(PoolInner::new()),
            mrs: Mutex::new(Vec::new()),
        })
    }

    #[cold]
    fn grow(&self, inner: &mut PoolInner, min: usize) {
        let len = inner.next_slab_len(min);
        let mem = alloc_slab(len);

        let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ;
        // SAFETY: `mem` stays alive in the slab list for the pool's life.
        let mr = unsafe {
            ibv_reg_mr(
                self.pd,
                mem.ptr as *mut libc::c_void,
                mem.len,
                access.0 as i32,
            )
        };
        assert!(!mr.is_null(), "failed to register a memory pool slab");

        // SAFETY: `mr` was just checked non-null.
        let (lkey, rkey) = unsafe { ((*mr).lkey, (*mr).rkey) };
        log::debug!(
            "mempool: registered {}MB slab, lkey={:#x} rkey={:#x}",
            mem.len >> 20,
            lkey,
            rkey
        );
        self.mrs.lock().unwrap().push(mr);
        inner.add_slab(mem, lkey, rkey);
    }

    /// Allocate a zeroed, page-aligned block of at least `len` bytes.
    pub fn alloc(self: &Arc<Self>, len: usize) -> PoolBuf {
        let mut inner = self.inner.lock().unwrap();
        let (ptr, rounded) = match inner.alloc(len) {
            Some(v) => v,
            None => {
                self.grow(&mut inner, roundup(len.max(1), page_size()));
                inner.alloc(len).expect("fresh slab cannot satisfy alloc")
            }
        };
        PoolBuf::new(
            NonNull::new(ptr).unwrap(),
            rounded,
            Some(self.clone() as Arc<dyn BufReturn>),
        )
    }

    /// Local key of the slab covering `ptr`.
    pub fn local_key(&self, ptr: *mut u8) -> LKey {
        self.inner.lock().unwrap().local_key(ptr)
    }

    /// Remote key of the slab covering `ptr`.
    pub fn remote_key(&self, ptr: *mut u8) -> RKey {
        self.inner.lock().unwrap().remote_key(ptr)
    }
}

impl BufReturn for MemPool {
    fn return_buf(&self, ptr: *mut u8) {
        self.inner.lock().unwrap().free(ptr);
    }
}

impl Drop for MemPool {
    fn drop(&mut self) {
        for &mr in self.mrs.lock().unwrap().iter() {
            // SAFETY: registered by this pool and not deregistered before.
            let rc = unsafe { ibv_dereg_mr(mr) };
            assert_eq!(rc, 0, "failed to deregister a memory pool slab");
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct MrEntry {
    pub mr: *mut ibv_mr,
    pub len: usize,
    pub lkey: LKey,
    pub rkey: RKey,
}

unsafe impl Send for MrEntry {}
unsafe impl Sync for MrEntry {}

/// Registration cache for caller-owned payload buffers.
///
/// Keyed by buffer start address; the first registration's length is
/// authoritative, so callers must never grow a buffer in place.
pub(crate) struct MrCache {
    pd: *mut ibv_pd,
    map: DashMap<usize, MrEntry, RandomState>,
}

unsafe impl Send for MrCache {}
unsafe impl Sync for MrCache {}

impl MrCache {
    pub fn new(pd: *mut ibv_pd) -> Arc<Self> {
        Arc::new(Self {
            pd,
            map: DashMap::with_hasher(RandomState::new()),
        })
    }

    /// Register `[ptr, ptr + len)` if this address has not been seen.
    pub fn ensure_registered(&self, ptr: *mut u8, len: usize) -> MrEntry {
        *self.map.entry(ptr as usize).or_insert_with(|| {
            let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
                | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
            // SAFETY: the caller guarantees the buffer outlives the van.
            let mr = unsafe { ibv_reg_mr(self.pd, ptr as *mut libc::c_void, len, access.0 as i32) };
            assert!(
                !mr.is_null(),
                "failed to register payload buffer of {} bytes",
                len
            );
            // SAFETY: just checked non-null.
            let (lkey, rkey) = unsafe { ((*mr).lkey, (*mr).rkey) };
            MrEntry { mr, len, lkey, rkey }
        })
    }

    /// Keys of an already-registered buffer.
    ///
    /// # Panics
    ///
    /// Panic if the address was never registered.
    pub fn get(&self, ptr: *mut u8) -> MrEntry {
        *self
            .map
            .get(&(ptr as usize))
            .expect("payload buffer not registered")
    }
}

impl Drop for MrCache {
    fn drop(&mut self) {
        for entry in self.map.iter() {
            // SAFETY: registered by this cache and not deregistered before.
            unsafe { ibv_dereg_mr(entry.mr) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_pool(slab_len: usize) -> PoolInner {
        let mut inner = PoolInner::new();
        inner.add_slab(alloc_slab(slab_len), 0x11, 0x22);
        inner
    }

    #[test]
    fn alloc_rounds_and_zeroes() {
        let mut pool = test_pool(1 << 20);
        let page = page_size();

        let (p1, len1) = pool.alloc(1).unwrap();
        assert_eq!(len1, page);
        assert_eq!(p1 as usize % page, 0);

        let (p2, len2) = pool.alloc(page + 1).unwrap();
        assert_eq!(len2, 2 * page);
        assert_ne!(p1, p2);

        // Dirty, free, realloc: must come back zeroed.
        // SAFETY: `p1` is a live allocation of `len1` bytes.
        unsafe { ptr::write_bytes(p1, 0xab, len1) };
        pool.free(p1);
        let (p3, _) = pool.alloc(1).unwrap();
        assert_eq!(p3, p1);
        // SAFETY: just allocated.
        assert!(unsafe { std::slice::from_raw_parts(p3, page) }
            .iter()
            .all(|&b| b == 0));
    }

    #[test]
    fn size_classes_are_separate() {
        let mut pool = test_pool(1 << 20);
        let page = page_size();

        let (small, _) = pool.alloc(16).unwrap();
        let (large, _) = pool.alloc(3 * page).unwrap();
        pool.free(small);
        pool.free(large);

        // A small allocation must not land on the freed large block.
        let (s2, _) = pool.alloc(16).unwrap();
        assert_eq!(s2, small);
        let (l2, _) = pool.alloc(3 * page).unwrap();
        assert_eq!(l2, large);
    }

    #[test]
    fn exhaustion_reports_none() {
        let mut pool = test_pool(page_size() * 4);
        assert!(pool.alloc(page_size() * 4).is_some());
        assert!(pool.alloc(1).is_none());
    }

    #[test]
    fn key_lookup_by_range() {
        let mut pool = test_pool(1 << 20);
        let (p, len) = pool.alloc(123).unwrap();
        assert_eq!(pool.local_key(p), 0x11);
        assert_eq!(pool.remote_key(p), 0x22);
        // Interior pointers resolve to the same slab.
        assert_eq!(pool.local_key((p as usize + len - 1) as *mut u8), 0x11);
    }

    #[test]
    #[should_panic(expected = "not owned by this pool")]
    fn foreign_free_faults() {
        let mut pool = test_pool(1 << 20);
        let mut other = [0u8; 8];
        pool.free(other.as_mut_ptr());
    }

    #[test]
    fn slab_growth_accounting() {
        let mut pool = PoolInner::new();
        assert_eq!(
            pool.next_slab_len(1),
            PoolInner::INITIAL_SLAB_LEN,
            "first slab uses the initial size"
        );
        assert_eq!(pool.next_slab_len(1), PoolInner::INITIAL_SLAB_LEN * 2);
        // Oversized requests win over the doubling schedule.
        let huge = 1 << 30;
        assert_eq!(pool.next_slab_len(huge), huge);
    }

    #[test]
    fn poolbuf_returns_on_drop() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counter(AtomicUsize);
        impl BufReturn for Counter {
            fn return_buf(&self, _: *mut u8) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut mem = [0u8; 8];
        let buf = PoolBuf::new(
            NonNull::new(mem.as_mut_ptr()).unwrap(),
            8,
            Some(counter.clone() as Arc<dyn BufReturn>),
        );
        assert_eq!(buf.len(), 8);
        drop(buf);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }
}
