//! Standalone reclaimer half of epoch-based reclamation, as described in
//! <https://www.cl.cam.ac.uk/techreports/UCAM-CL-TR-579.pdf>, with the
//! reclaim work moved off the retiring threads onto one dedicated thread.
//!
//! Typical usage: readers of a lock-free structure hold an
//! [`Epoch`](crate::epoch::Epoch) critical section open while they touch
//! shared elements. A writer that unlinks an element retires a closure that
//! frees it; the closure runs on the collector thread once every critical
//! section opened before the retirement has closed.

use core::mem;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::epoch::Epoch;
use crate::queue::ConcurrentBoundedQueue;
use crate::sched::{DefaultSched, SchedInterface};

struct ReclaimTask<R> {
    reclaimer: Option<R>,
    lowest_epoch: u64,
}

// The default task doubles as the shutdown sentinel: no reclaimer, and a
// lowest_epoch no real retirement can carry.
impl<R> Default for ReclaimTask<R> {
    fn default() -> Self {
        ReclaimTask {
            reclaimer: None,
            lowest_epoch: u64::MAX,
        }
    }
}

struct Core<R, S: SchedInterface> {
    epoch: Epoch,
    queue: ConcurrentBoundedQueue<ReclaimTask<R>, S>,
}

/// Deferred-destruction collector with a bounded hand-off queue.
///
/// `retire` never blocks on a slow collector until the queue fills; past
/// that it applies backpressure by spinning for a slot.
pub struct GarbageCollector<R, S = DefaultSched>
where
    R: FnOnce() + Send + 'static,
    S: SchedInterface + Send + Sync + 'static,
{
    core: Arc<Core<R, S>>,
    gc_thread: Option<JoinHandle<()>>,
}

impl<R, S> GarbageCollector<R, S>
where
    R: FnOnce() + Send + 'static,
    S: SchedInterface + Send + Sync + 'static,
{
    pub fn new() -> Self {
        GarbageCollector {
            core: Arc::new(Core {
                epoch: Epoch::new(),
                queue: ConcurrentBoundedQueue::new(1),
            }),
            gc_thread: None,
        }
    }

    /// Set how many retirements can queue before `retire` starts blocking.
    /// Only valid before `start`.
    pub fn set_queue_capacity(&mut self, min_capacity: usize) {
        debug_assert!(self.gc_thread.is_none());
        if let Some(core) = Arc::get_mut(&mut self.core) {
            core.queue.reserve_and_clear(min_capacity);
        }
    }

    /// Spawn the background thread that consumes and runs reclaim tasks.
    pub fn start(&mut self) {
        if self.gc_thread.is_none() {
            let core = self.core.clone();
            self.gc_thread = Some(std::thread::spawn(move || core.keep_reclaim()));
        }
    }

    #[inline]
    pub fn epoch(&self) -> &Epoch {
        &self.core.epoch
    }

    /// Queue `reclaimer` to run once every reader critical section opened
    /// before this call has closed.
    #[inline]
    pub fn retire(&self, reclaimer: R) {
        let lowest_epoch = self.core.epoch.tick();
        self.retire_at(reclaimer, lowest_epoch);
    }

    /// Queue `reclaimer` with an explicitly captured epoch, letting callers
    /// tick once for a whole batch of retirements.
    #[inline]
    pub fn retire_at(&self, reclaimer: R, lowest_epoch: u64) {
        self.core.queue.push_with::<true, false, false, _>(move |slot| {
            *slot = ReclaimTask {
                reclaimer: Some(reclaimer),
                lowest_epoch,
            };
        });
    }

    /// Stop the background thread after it finishes the queued tasks whose
    /// epoch already passed. Tasks still pinned by open critical sections
    /// at that point are the caller's to drain.
    pub fn stop(&mut self) {
        if let Some(gc_thread) = self.gc_thread.take() {
            self.core
                .queue
                .push_with::<true, false, false, _>(|slot| *slot = ReclaimTask::default());
            if gc_thread.join().is_err() {
                log::error!("garbage collector thread panicked");
            }
        }
    }
}

impl<R, S> Default for GarbageCollector<R, S>
where
    R: FnOnce() + Send + 'static,
    S: SchedInterface + Send + Sync + 'static,
{
    fn default() -> Self {
        GarbageCollector::new()
    }
}

impl<R, S> Drop for GarbageCollector<R, S>
where
    R: FnOnce() + Send + 'static,
    S: SchedInterface + Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

impl<R, S> Core<R, S>
where
    R: FnOnce() + Send + 'static,
    S: SchedInterface + Send + Sync + 'static,
{
    fn keep_reclaim(&self) {
        log::debug!("garbage collector thread started");
        let mut running = true;
        let batch = 1024.min(self.queue.capacity());
        let mut index = 0;
        let mut tasks: Vec<ReclaimTask<R>> = Vec::with_capacity(batch);
        let mut backoff_us: u32 = 1000;
        while running {
            if index == tasks.len() {
                tasks.clear();
                running = self.consume_reclaim_task(batch, &mut tasks);
                index = 0;
            }

            let reclaimed = self.reclaim_start_from(index, &mut tasks);
            index += reclaimed;

            if reclaimed < 100 {
                backoff_us = (backoff_us + 10).min(100_000);
                S::sleep_us(backoff_us);
            } else if reclaimed >= batch {
                backoff_us >>= 1;
            }
        }
        log::debug!("garbage collector thread stopped");
    }

    fn consume_reclaim_task(&self, batch: usize, tasks: &mut Vec<ReclaimTask<R>>) -> bool {
        let mut running = true;
        self.queue.try_pop_n_with::<false, false, _>(
            |slots| {
                for task in slots {
                    if task.lowest_epoch == u64::MAX {
                        running = false;
                        break;
                    }
                    tasks.push(mem::take(task));
                }
            },
            batch,
        );
        running
    }

    fn reclaim_start_from(&self, start: usize, tasks: &mut [ReclaimTask<R>]) -> usize {
        let mut reclaimed = 0;
        let low_water_mark = self.epoch.low_water_mark();
        for task in &mut tasks[start..] {
            if task.lowest_epoch > low_water_mark {
                break;
            }
            if let Some(reclaimer) = task.reclaimer.take() {
                // A reclaimer may itself retire further objects.
                reclaimer();
            }
            reclaimed += 1;
        }
        reclaimed
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    type BoxedCollector = GarbageCollector<Box<dyn FnOnce() + Send>>;

    #[test]
    fn retired_tasks_run_without_readers() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut gc = BoxedCollector::new();
        gc.set_queue_capacity(1024);
        gc.start();
        for _ in 0..1000 {
            let counter = counter.clone();
            gc.retire(Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }));
        }
        gc.epoch().tick();
        gc.stop();
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn open_critical_section_defers_reclaim() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut gc = BoxedCollector::new();
        gc.set_queue_capacity(64);
        gc.start();

        let guard = gc.epoch().enter();
        let counter_in_task = counter.clone();
        gc.retire(Box::new(move || {
            counter_in_task.fetch_add(1, Ordering::Relaxed);
        }));
        // The guard was opened before the retirement; the task must wait.
        thread::sleep(Duration::from_millis(100));
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        drop(guard);
        gc.stop();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stop_without_start_is_a_no_op() {
        let mut gc = BoxedCollector::new();
        gc.stop();
    }

    #[test]
    fn batched_retirement_with_shared_epoch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut gc = BoxedCollector::new();
        gc.set_queue_capacity(256);
        gc.start();
        let lowest_epoch = gc.epoch().tick();
        for _ in 0..100 {
            let counter = counter.clone();
            gc.retire_at(
                Box::new(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                }),
                lowest_epoch,
            );
        }
        gc.stop();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }
}
