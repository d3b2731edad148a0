use core::ops::{Deref, DerefMut};

pub(crate) const CACHELINE_SIZE: usize = 64;

/// Wrapper that pads and aligns `T` to a cache line.
///
/// Hot atomics that are written from different threads (queue sequence
/// counters, per-thread counter cells) each get their own line so that
/// unrelated writers do not bounce it between cores.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct CacheAligned<T>(pub T);

impl<T> CacheAligned<T> {
    pub const fn new(value: T) -> Self {
        CacheAligned(value)
    }
}

impl<T> Deref for CacheAligned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for CacheAligned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// Monotonic wall-clock in 64-second units, truncated to 16 bits.
///
/// Coarse on purpose: consumers only need to tell "long enough ago" apart
/// from "just now", and the low precision lets the timestamp share a word
/// with a packed pointer.
#[cfg(unix)]
pub(crate) fn coarse_monotonic_timestamp() -> u16 {
    let mut spec = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let r = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut spec) };
    debug_assert_eq!(r, 0, "clock_gettime(CLOCK_MONOTONIC_RAW) failed");
    (spec.tv_sec >> 6) as u16
}

#[cfg(test)]
mod test {
    use super::*;
    use core::mem;

    #[test]
    fn cache_aligned_layout() {
        assert_eq!(mem::align_of::<CacheAligned<u8>>(), CACHELINE_SIZE);
        assert_eq!(mem::size_of::<CacheAligned<u8>>(), CACHELINE_SIZE);
        assert_eq!(mem::size_of::<CacheAligned<[u8; 65]>>(), 2 * CACHELINE_SIZE);
    }

    #[test]
    fn coarse_timestamp_is_stable_within_a_tick() {
        let a = coarse_monotonic_timestamp();
        let b = coarse_monotonic_timestamp();
        // 64-second units: two immediate reads differ by at most one step.
        assert!(b.wrapping_sub(a) <= 1);
    }
}
