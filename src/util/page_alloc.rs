use std::ptr;

use libc::*;

use crate::util::math::{page_size, roundup};

const HUGE_PAGE_SIZE: usize = 1 << 21;

enum AllocType {
    Mmap,
    Memalign,
}

/// An owned, page-aligned, zeroed region of raw memory.
pub(crate) struct PageAlloc {
    pub ptr: *mut u8,
    pub len: usize,
    alloc_type: AllocType,
}

unsafe impl Send for PageAlloc {}
unsafe impl Sync for PageAlloc {}

impl Drop for PageAlloc {
    fn drop(&mut self) {
        // SAFETY: FFI.
        unsafe {
            match self.alloc_type {
                AllocType::Mmap => assert!(
                    munmap(self.ptr as *mut c_void, self.len) == 0,
                    "munmap failed"
                ),
                AllocType::Memalign => free(self.ptr as *mut c_void),
            }
        };
    }
}

#[inline]
fn alloc_mmap(len: usize, flags: i32) -> *mut u8 {
    // SAFETY: FFI.
    let ret = unsafe {
        mmap(
            ptr::null_mut(),
            len,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS | flags,
            -1,
            0,
        ) as *mut u8
    };

    if ret != MAP_FAILED as _ {
        ret
    } else {
        ptr::null_mut()
    }
}

#[inline]
fn alloc_memalign(len: usize, align: usize) -> *mut u8 {
    let mut p = ptr::null_mut();
    // SAFETY: FFI.
    let ret = unsafe { posix_memalign(&mut p, align, len) };
    if ret == 0 {
        // Fresh mmap pages are zeroed; memalign memory is not.
        // SAFETY: `p` is valid for `len` bytes.
        unsafe { ptr::write_bytes(p as *mut u8, 0, len) };
        p as _
    } else {
        ptr::null_mut()
    }
}

/// Allocate a zeroed, page-aligned slab of at least `len` bytes.
///
/// Slabs of 2MB and above try hugepages first; everything falls back to
/// normal mmap pages and finally `posix_memalign`. Failure of all three
/// is host-OOM and fatal.
pub(crate) fn alloc_slab(len: usize) -> PageAlloc {
    let len = roundup(len, page_size());

    if len >= HUGE_PAGE_SIZE {
        let huge_len = roundup(len, HUGE_PAGE_SIZE);
        let ptr = alloc_mmap(huge_len, MAP_HUGETLB);
        if !ptr.is_null() {
            return PageAlloc {
                ptr,
                len: huge_len,
                alloc_type: AllocType::Mmap,
            };
        }
        log::warn!(
            "failed to mmap {}MB hugepages, trying normal pages; performance can be low",
            huge_len >> 20
        );
    }

    let ptr = alloc_mmap(len, 0);
    if !ptr.is_null() {
        return PageAlloc {
            ptr,
            len,
            alloc_type: AllocType::Mmap,
        };
    }

    let ptr = alloc_memalign(len, page_size());
    if !ptr.is_null() {
        return PageAlloc {
            ptr,
            len,
            alloc_type: AllocType::Memalign,
        };
    }

    panic!("failed to allocate {}MB memory", len >> 20);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_and_zeroed() {
        let a = alloc_slab(3 * page_size() + 1);
        assert_eq!(a.ptr as usize % page_size(), 0);
        assert_eq!(a.len, 4 * page_size());

        // SAFETY: freshly allocated region of `a.len` bytes.
        let data = unsafe { std::slice::from_raw_parts(a.ptr, a.len) };
        assert!(data.iter().all(|&b| b == 0));
    }
}
