//! Reader registry for epoch-based reclamation.
//!
//! Readers bracket their accesses to a shared structure with
//! [`Epoch::enter`]; writers [`Epoch::tick`] after unlinking an object and
//! hold its destruction until [`Epoch::low_water_mark`] reaches that tick.
//! A registration outside any critical section contributes `u64::MAX`, so
//! with no readers the low-water-mark is unbounded and everything retired
//! is immediately reclaimable.

use core::sync::atomic::{fence, AtomicU64, Ordering};

use crate::tls::LeakyEnumerableThreadLocal;
use crate::utils::CacheAligned;

pub struct Epoch {
    global: CacheAligned<AtomicU64>,
    slots: LeakyEnumerableThreadLocal<CacheAligned<AtomicU64>>,
}

impl Epoch {
    pub fn new() -> Self {
        Epoch {
            global: CacheAligned::new(AtomicU64::new(0)),
            slots: LeakyEnumerableThreadLocal::with_constructor(|| {
                CacheAligned::new(AtomicU64::new(u64::MAX))
            }),
        }
    }

    /// Advance the global version and return the new value.
    #[inline]
    pub fn tick(&self) -> u64 {
        self.global.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Open a reader critical section. Anything unlinked after this point
    /// carries a higher tick and outlives the returned guard.
    ///
    /// Critical sections do not nest on one thread.
    pub fn enter(&self) -> EpochGuard<'_> {
        let slot = &self.slots.local().0;
        debug_assert_eq!(
            slot.load(Ordering::Relaxed),
            u64::MAX,
            "epoch critical sections do not nest"
        );
        slot.store(self.global.load(Ordering::Relaxed), Ordering::Relaxed);
        // Publish the registration before any protected pointer is read. A
        // low_water_mark that misses the store is ordered before it, and the
        // pointers this section will read are then no older than that mark.
        fence(Ordering::SeqCst);
        EpochGuard { slot }
    }

    /// Minimum tick across the currently open critical sections;
    /// `u64::MAX` when none are open.
    pub fn low_water_mark(&self) -> u64 {
        fence(Ordering::SeqCst);
        let mut low_water_mark = u64::MAX;
        self.slots.for_each(|slots| {
            for slot in slots {
                low_water_mark = low_water_mark.min(slot.load(Ordering::Relaxed));
            }
        });
        low_water_mark
    }
}

impl Default for Epoch {
    fn default() -> Self {
        Epoch::new()
    }
}

pub struct EpochGuard<'a> {
    slot: &'a AtomicU64,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.slot.store(u64::MAX, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn tick_is_monotonic() {
        let epoch = Epoch::new();
        assert_eq!(epoch.tick(), 1);
        assert_eq!(epoch.tick(), 2);
        assert_eq!(epoch.tick(), 3);
    }

    #[test]
    fn low_water_mark_is_unbounded_without_readers() {
        let epoch = Epoch::new();
        epoch.tick();
        assert_eq!(epoch.low_water_mark(), u64::MAX);
    }

    #[test]
    fn open_section_pins_low_water_mark() {
        let epoch = Epoch::new();
        epoch.tick();
        epoch.tick();
        let guard = epoch.enter();
        assert_eq!(epoch.low_water_mark(), 2);
        // Later ticks do not move an already-open section.
        epoch.tick();
        assert_eq!(epoch.low_water_mark(), 2);
        drop(guard);
        assert_eq!(epoch.low_water_mark(), u64::MAX);
    }

    #[test]
    fn low_water_mark_is_minimum_across_threads() {
        let epoch = std::sync::Arc::new(Epoch::new());
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let reader = {
            let epoch = epoch.clone();
            thread::spawn(move || {
                let _guard = epoch.enter(); // pins tick 0
                entered_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
        };
        entered_rx.recv().unwrap();
        epoch.tick();
        let _local = epoch.enter(); // pins tick 1
        assert_eq!(epoch.low_water_mark(), 0);
        release_tx.send(()).unwrap();
        reader.join().unwrap();
        assert_eq!(epoch.low_water_mark(), 1);
    }
}
