use std::sync::OnceLock;

/// Round `x` up to the next multiple of `n`, where `n` is a power of two.
pub const fn roundup(x: usize, n: usize) -> usize {
    assert!(n.is_power_of_two());
    (x + n - 1) & !(n - 1)
}

/// Round `v` down to the previous multiple of `align`.
pub const fn align_floor(v: usize, align: usize) -> usize {
    v - (v % align)
}

/// Round `v` up to the next multiple of `align`.
/// Unlike [`roundup`], `align` need not be a power of two.
pub const fn align_ceil(v: usize, align: usize) -> usize {
    align_floor(v + align - 1, align)
}

/// Return the system page size.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: FFI.
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(sz > 0, "sysconf(_SC_PAGESIZE) failed");
        sz as usize
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(roundup(0, 8), 0);
        assert_eq!(roundup(1, 8), 8);
        assert_eq!(roundup(8, 8), 8);
        assert_eq!(roundup(4097, 4096), 8192);

        assert_eq!(align_ceil(0, 4000), 0);
        assert_eq!(align_ceil(1, 4000), 4000);
        assert_eq!(align_ceil(4000, 4000), 4000);
        assert_eq!(align_ceil(4001, 4000), 8000);
        assert_eq!(align_floor(4001, 4000), 4000);
    }

    #[test]
    fn page_size_sane() {
        let sz = page_size();
        assert!(sz.is_power_of_two());
        assert!(sz >= 4096);
    }
}
