//! Small reusable integer ids for live threads.
//!
//! Ids index the segmented vectors backing
//! [`EnumerableThreadLocal`](crate::tls::EnumerableThreadLocal), so they must
//! stay dense: a dying thread's id goes back into a free list and the next
//! thread to appear takes it over, together with the storage slots it maps
//! to.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::vector::ConcurrentVector;

/// Reusable id allocator with an alive-set.
///
/// `allocate`/`deallocate` happen on thread birth and death only, so a plain
/// mutex guards the free list; the alive bitmap is kept lock-free because
/// `for_each_alive` may run concurrently with both.
pub struct IdAllocator {
    next_id: AtomicU32,
    free_ids: Mutex<Vec<u32>>,
    alive: ConcurrentVector<AtomicU64>,
}

impl IdAllocator {
    pub fn new() -> Self {
        IdAllocator {
            next_id: AtomicU32::new(0),
            free_ids: Mutex::new(Vec::new()),
            alive: ConcurrentVector::new(8),
        }
    }

    pub fn allocate(&self) -> u32 {
        let recycled = self.free_ids.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let id = recycled.unwrap_or_else(|| self.next_id.fetch_add(1, Ordering::Relaxed));
        self.alive
            .ensure(id as usize / 64)
            .fetch_or(1 << (id % 64), Ordering::Release);
        id
    }

    pub fn deallocate(&self, id: u32) {
        self.alive
            .ensure(id as usize / 64)
            .fetch_and(!(1 << (id % 64)), Ordering::Release);
        self.free_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id);
    }

    /// One past the largest id ever allocated.
    pub fn end(&self) -> u32 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Visit the currently alive ids as maximal `[begin, end)` runs.
    pub fn for_each_alive<F: FnMut(u32, u32)>(&self, mut callback: F) {
        let end = self.end();
        let snapshot = self.alive.snapshot();
        let words = snapshot.size().min((end as usize + 63) / 64);
        let mut run_begin = None;
        for word_index in 0..words {
            let word = snapshot.get(word_index).load(Ordering::Acquire);
            for bit in 0..64 {
                let id = (word_index * 64 + bit) as u32;
                if id >= end {
                    break;
                }
                if word & (1 << bit) != 0 {
                    run_begin.get_or_insert(id);
                } else if let Some(begin) = run_begin.take() {
                    callback(begin, id);
                }
            }
        }
        if let Some(begin) = run_begin.take() {
            callback(begin, end);
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        IdAllocator::new()
    }
}

/// Registry whose ids are returned when their thread exits.
pub(crate) fn registry() -> &'static IdAllocator {
    static REGISTRY: OnceLock<IdAllocator> = OnceLock::new();
    REGISTRY.get_or_init(IdAllocator::new)
}

/// Registry whose ids are held for the lifetime of the process.
///
/// Exists because a thread-local that outlives the thread-exit hook would
/// otherwise observe its id already reassigned; leaky storages trade the id
/// space for immunity to destruction order.
pub(crate) fn leaky_registry() -> &'static IdAllocator {
    static REGISTRY: OnceLock<IdAllocator> = OnceLock::new();
    REGISTRY.get_or_init(IdAllocator::new)
}

struct IdGuard {
    id: u32,
}

impl IdGuard {
    fn new() -> Self {
        IdGuard {
            id: registry().allocate(),
        }
    }
}

impl Drop for IdGuard {
    fn drop(&mut self) {
        registry().deallocate(self.id);
    }
}

thread_local! {
    static THREAD_ID: IdGuard = IdGuard::new();
    static LEAKY_THREAD_ID: core::cell::Cell<u32> = const { core::cell::Cell::new(u32::MAX) };
}

/// Id of the calling thread in the releasing registry.
pub(crate) fn current_thread_id() -> u32 {
    THREAD_ID.with(|guard| guard.id)
}

/// Id of the calling thread in the leaky registry.
pub(crate) fn current_leaky_thread_id() -> u32 {
    LEAKY_THREAD_ID.with(|cell| {
        let id = cell.get();
        if id != u32::MAX {
            return id;
        }
        let id = leaky_registry().allocate();
        cell.set(id);
        id
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn ids_start_dense() {
        let allocator = IdAllocator::new();
        assert_eq!(allocator.allocate(), 0);
        assert_eq!(allocator.allocate(), 1);
        assert_eq!(allocator.allocate(), 2);
        assert_eq!(allocator.end(), 3);
    }

    #[test]
    fn freed_id_is_reused() {
        let allocator = IdAllocator::new();
        let a = allocator.allocate();
        let b = allocator.allocate();
        allocator.deallocate(a);
        assert_eq!(allocator.allocate(), a);
        allocator.deallocate(b);
        assert_eq!(allocator.allocate(), b);
        assert_eq!(allocator.end(), 2);
    }

    #[test]
    fn alive_runs_skip_freed_ids() {
        let allocator = IdAllocator::new();
        for _ in 0..8 {
            allocator.allocate();
        }
        allocator.deallocate(3);
        allocator.deallocate(4);
        let mut runs = Vec::new();
        allocator.for_each_alive(|begin, end| runs.push((begin, end)));
        assert_eq!(runs, vec![(0, 3), (5, 8)]);
    }

    #[test]
    fn alive_run_reaches_end_watermark() {
        let allocator = IdAllocator::new();
        for _ in 0..70 {
            allocator.allocate();
        }
        let mut runs = Vec::new();
        allocator.for_each_alive(|begin, end| runs.push((begin, end)));
        assert_eq!(runs, vec![(0, 70)]);
    }

    #[test]
    fn thread_exit_releases_thread_id() {
        // Sequential spawn/join cycles must recycle ids rather than keep
        // minting new ones. Other concurrently running tests may take a few
        // ids of their own, hence the slack in the bound.
        let before = registry().end();
        for _ in 0..50 {
            thread::spawn(current_thread_id).join().unwrap();
        }
        let after = registry().end();
        assert!(after - before < 25, "ids were not reused: {} -> {}", before, after);
    }

    #[test]
    fn leaky_ids_are_never_reused() {
        let id = thread::spawn(current_leaky_thread_id).join().unwrap();
        let next = thread::spawn(current_leaky_thread_id).join().unwrap();
        assert_ne!(id, next);
    }
}
