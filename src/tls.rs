//! Thread-local storage that can be enumerated from any thread.
//!
//! Each instance owns a [`ConcurrentVector`] indexed by a small reusable
//! thread id, so `local()` costs one segmented-vector lookup; a single-entry
//! per-thread cache brings repeated hits on the same instance down to a
//! pointer compare. Unlike `thread_local!`, instances are plain values:
//! dynamically many can exist, and iteration visits every thread's slot.

use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::thread_id::{self, IdAllocator};
use crate::vector::ConcurrentVector;

const STORAGE_BLOCK_SIZE: usize = 128;

/// Per-thread slots enumerable from any thread.
///
/// `LEAKY` selects the id registry: leaky storages keep thread ids (and thus
/// slots) for the whole process and stay usable from thread-locals that run
/// after the id-releasing exit hook.
pub struct EnumerableThreadLocal<T, const LEAKY: bool = false> {
    storage: ConcurrentVector<T>,
    instance_id: usize,
}

pub type LeakyEnumerableThreadLocal<T> = EnumerableThreadLocal<T, true>;

thread_local! {
    // {owning instance id, slot pointer}, shared by all instances. Instance
    // ids are never reused, so a stale entry can only miss, never alias.
    static CACHE: Cell<(usize, *const ())> = const { Cell::new((0, ptr::null())) };
}

fn next_instance_id() -> usize {
    static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

impl<T: Default + Send + Sync + 'static, const LEAKY: bool> EnumerableThreadLocal<T, LEAKY> {
    pub fn new() -> Self {
        EnumerableThreadLocal {
            storage: ConcurrentVector::new(STORAGE_BLOCK_SIZE),
            instance_id: next_instance_id(),
        }
    }
}

impl<T: Default + Send + Sync + 'static, const LEAKY: bool> Default
    for EnumerableThreadLocal<T, LEAKY>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static, const LEAKY: bool> EnumerableThreadLocal<T, LEAKY> {
    pub fn with_constructor<C>(constructor: C) -> Self
    where
        C: Fn() -> T + Send + Sync + 'static,
    {
        EnumerableThreadLocal {
            storage: ConcurrentVector::with_constructor(STORAGE_BLOCK_SIZE, constructor),
            instance_id: next_instance_id(),
        }
    }

    /// The slot exclusive to the current thread.
    #[inline]
    pub fn local(&self) -> &T {
        if let Some(item) = self.local_fast() {
            return item;
        }
        self.local_slow()
    }

    /// Cache-only lookup. `None` means the caller has to take the
    /// [`local`](Self::local) path once to repopulate the cache.
    #[inline]
    pub fn local_fast(&self) -> Option<&T> {
        CACHE.with(|cache| {
            let (owner, item) = cache.get();
            if owner == self.instance_id {
                // Points into our storage; cells never move and we outlive
                // the returned borrow.
                Some(unsafe { &*(item as *const T) })
            } else {
                None
            }
        })
    }

    #[cold]
    fn local_slow(&self) -> &T {
        let id = if LEAKY {
            thread_id::current_leaky_thread_id()
        } else {
            thread_id::current_thread_id()
        };
        let item = self.storage.ensure(id as usize);
        CACHE.with(|cache| cache.set((self.instance_id, item as *const T as *const ())));
        item
    }

    /// Visit the slots of every thread that exists now or ever existed, as
    /// contiguous runs.
    pub fn for_each<F: FnMut(&[T])>(&self, callback: F) {
        let snapshot = self.storage.snapshot();
        let end = (self.allocator().end() as usize).min(snapshot.size());
        snapshot.for_each(0, end, callback);
    }

    /// Visit only the slots of currently live threads.
    pub fn for_each_alive<F: FnMut(&[T])>(&self, mut callback: F) {
        let snapshot = self.storage.snapshot();
        let size = snapshot.size();
        self.allocator().for_each_alive(|begin, end| {
            let begin = (begin as usize).min(size);
            let end = (end as usize).min(size);
            snapshot.for_each(begin, end, &mut callback);
        });
    }

    fn allocator(&self) -> &'static IdAllocator {
        if LEAKY {
            thread_id::leaky_registry()
        } else {
            thread_id::registry()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn local_returns_same_slot_for_same_thread() {
        let tls = EnumerableThreadLocal::<AtomicU64>::new();
        let a = tls.local() as *const AtomicU64;
        let b = tls.local() as *const AtomicU64;
        assert_eq!(a, b);
    }

    #[test]
    fn cache_distinguishes_instances() {
        let first = EnumerableThreadLocal::<AtomicU64>::new();
        let second = EnumerableThreadLocal::<AtomicU64>::new();
        first.local().store(1, Ordering::Relaxed);
        second.local().store(2, Ordering::Relaxed);
        assert_eq!(first.local().load(Ordering::Relaxed), 1);
        assert_eq!(second.local().load(Ordering::Relaxed), 2);
        assert!(second.local_fast().is_some());
        assert!(first.local_fast().is_none());
    }

    #[test]
    fn constructor_initializes_slots() {
        let tls = EnumerableThreadLocal::<AtomicU64, false>::with_constructor(|| {
            AtomicU64::new(10086)
        });
        assert_eq!(tls.local().load(Ordering::Relaxed), 10086);
    }

    #[test]
    fn for_each_sums_every_thread() {
        let tls = Arc::new(EnumerableThreadLocal::<AtomicU64>::new());
        let barrier = Arc::new(Barrier::new(10));
        let threads: Vec<_> = (0..10)
            .map(|_| {
                let tls = tls.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for i in 1..=1000u64 {
                        let local = tls.local();
                        local.store(local.load(Ordering::Relaxed) + i, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        let mut sum = 0;
        tls.for_each(|cells| {
            sum += cells
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .sum::<u64>();
        });
        assert_eq!(sum, 10 * 500_500);
    }

    #[test]
    fn for_each_alive_sees_running_threads() {
        let tls = Arc::new(LeakyEnumerableThreadLocal::<AtomicU64>::new());
        tls.local().store(7, Ordering::Relaxed);
        let mut sum = 0;
        tls.for_each_alive(|cells| {
            sum += cells
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .sum::<u64>();
        });
        assert_eq!(sum, 7);
    }
}
