//! Pluggable blocking primitives.
//!
//! Every container in this crate funnels its blocking through
//! [`SchedInterface`] so that the same protocol code can run on the kernel
//! futex, on a userspace-simulated scheduler, or on a deterministic
//! sleep-poll implementation in tests.

use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;
use std::time::Instant;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod linux;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use linux::KernelSched;

/// The scheduler used by containers unless another one is named.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub type DefaultSched = KernelSched;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub type DefaultSched = SpinSched;

/// OS error reported by a failed wait.
///
/// Waits have exactly three interesting outcomes besides success, so the
/// raw errno is kept and classified lazily.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    /// The timeout expired before the futex was woken.
    pub fn timed_out(self) -> bool {
        self.0 == libc::ETIMEDOUT
    }

    /// The futex value did not match `expected`; the thread never slept.
    pub fn no_match(self) -> bool {
        self.0 == libc::EAGAIN
    }

    /// The sleep was interrupted by a signal.
    pub fn interrupted(self) -> bool {
        self.0 == libc::EINTR
    }
}

/// Minimal scheduling surface: block on a 32-bit word, wake it, and give up
/// the processor.
///
/// `create`/`destroy` exist for userspace-simulated implementations that
/// need a kernel object per futex word; the kernel futex needs neither, so
/// both default to no-ops.
pub trait SchedInterface {
    fn create(_futex: &AtomicU32) {}

    fn destroy(_futex: &AtomicU32) {}

    /// Park the current thread while `futex` still holds `expected`.
    ///
    /// Returns `Ok(())` on a wakeup and `Err` with the classified errno
    /// otherwise. Does not guard against spurious wakeups; callers re-check
    /// their condition in a loop.
    fn wait(futex: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<(), Errno>;

    /// Wake at most one thread waiting on `futex`. Returns how many woke.
    fn wake_one(futex: &AtomicU32) -> usize;

    /// Wake every thread waiting on `futex`. Returns how many woke.
    fn wake_all(futex: &AtomicU32) -> usize;

    /// Let another runnable thread go first, if there is one.
    fn yield_now();

    /// Give up the processor for at least `us` microseconds.
    fn sleep_us(us: u32);
}

/// Sleep-polling stand-in for a real futex.
///
/// `wait` samples the word at millisecond cadence instead of sleeping in the
/// kernel, which makes it portable and keeps test schedules deterministic:
/// there is no wakeup edge to race with, only the value change itself.
pub struct SpinSched;

impl SchedInterface for SpinSched {
    fn wait(futex: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<(), Errno> {
        if futex.load(Ordering::SeqCst) != expected {
            return Err(Errno(libc::EAGAIN));
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            Self::sleep_us(1000);
            if futex.load(Ordering::SeqCst) != expected {
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Errno(libc::ETIMEDOUT));
                }
            }
        }
    }

    fn wake_one(_futex: &AtomicU32) -> usize {
        // Pollers notice the value change on their own.
        0
    }

    fn wake_all(_futex: &AtomicU32) -> usize {
        0
    }

    fn yield_now() {
        std::thread::yield_now();
    }

    fn sleep_us(us: u32) {
        std::thread::sleep(Duration::from_micros(us as u64));
    }
}

/// A single futex word bound to a scheduler.
///
/// Runs the scheduler's `create`/`destroy` hooks over the word's lifetime so
/// that userspace-simulated schedulers can attach their per-word state.
pub struct Futex<S: SchedInterface> {
    value: AtomicU32,
    _sched: PhantomData<S>,
}

impl<S: SchedInterface> Futex<S> {
    pub fn new(value: u32) -> Self {
        let futex = Futex {
            value: AtomicU32::new(value),
            _sched: PhantomData,
        };
        S::create(&futex.value);
        futex
    }

    #[inline]
    pub fn value(&self) -> &AtomicU32 {
        &self.value
    }

    #[inline]
    pub fn wait(&self, expected: u32, timeout: Option<Duration>) -> Result<(), Errno> {
        S::wait(&self.value, expected, timeout)
    }

    #[inline]
    pub fn wake_one(&self) -> usize {
        S::wake_one(&self.value)
    }

    #[inline]
    pub fn wake_all(&self) -> usize {
        S::wake_all(&self.value)
    }
}

impl<S: SchedInterface> Drop for Futex<S> {
    fn drop(&mut self) {
        S::destroy(&self.value);
    }
}

impl<S: SchedInterface> Default for Futex<S> {
    fn default() -> Self {
        Futex::new(0)
    }
}
