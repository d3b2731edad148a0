use core::ptr;
use core::sync::atomic::AtomicU32;
use core::time::Duration;

use crate::sched::{Errno, SchedInterface};

/// The kernel futex.
///
/// Futexes are marked process-private: the kernel can then key its wait
/// queue on the virtual address alone and skip the global futex table.
pub struct KernelSched;

impl SchedInterface for KernelSched {
    #[inline]
    fn wait(futex: &AtomicU32, expected: u32, timeout: Option<Duration>) -> Result<(), Errno> {
        let ts = convert_timeout(timeout);
        let ts_ptr = ts
            .as_ref()
            .map(|ts_ref| ts_ref as *const _)
            .unwrap_or(ptr::null());
        let r = unsafe {
            futex_syscall(
                futex.as_ptr() as *mut i32,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                expected as i32,
                ts_ptr,
                ptr::null_mut(),
                0,
            )
        };
        match r {
            0 => Ok(()),
            -1 => {
                let e = errno();
                debug_assert!(
                    e == libc::EAGAIN
                        || e == libc::EINTR
                        || (e == libc::ETIMEDOUT && ts.is_some()),
                    "unexpected errno of futex_wait syscall: {}",
                    e
                );
                Err(Errno(e))
            }
            r => {
                debug_assert!(false, "unexpected return value of futex_wait syscall: {}", r);
                Ok(())
            }
        }
    }

    #[inline]
    fn wake_one(futex: &AtomicU32) -> usize {
        wake(futex, 1)
    }

    #[inline]
    fn wake_all(futex: &AtomicU32) -> usize {
        wake(futex, i32::MAX)
    }

    #[inline]
    fn yield_now() {
        let r = unsafe { libc::sched_yield() };
        debug_assert_eq!(r, 0, "unexpected return value of sched_yield: {}", r);
    }

    #[inline]
    fn sleep_us(us: u32) {
        let r = unsafe { libc::usleep(us) };
        debug_assert!(
            r == 0 || errno() == libc::EINTR,
            "unexpected return value of usleep: {}",
            r
        );
    }
}

fn wake(futex: &AtomicU32, wake_count: i32) -> usize {
    let r = unsafe {
        futex_syscall(
            futex.as_ptr() as *mut i32,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            wake_count,
            ptr::null(),
            ptr::null_mut(),
            0,
        )
    };
    debug_assert!(r >= 0, "unexpected return value of futex_wake syscall: {}", r);
    r.max(0) as usize
}

// Only the targets this backend actually builds for.
fn errno() -> i32 {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location()
    }
    #[cfg(target_os = "android")]
    unsafe {
        *libc::__errno()
    }
}

unsafe fn futex_syscall(
    uaddr: *mut libc::c_int,
    futex_op: libc::c_int,
    val: libc::c_int,
    timeout: *const libc::timespec,
    uaddr2: *mut libc::c_void,
    val3: libc::c_int,
) -> libc::c_long {
    libc::syscall(libc::SYS_futex, uaddr, futex_op, val, timeout, uaddr2, val3)
}

// x32 Linux uses a non-standard type for tv_nsec in timespec.
// See https://sourceware.org/bugzilla/show_bug.cgi?id=16437
#[cfg(all(target_arch = "x86_64", target_pointer_width = "32"))]
#[allow(non_camel_case_types)]
type tv_nsec_t = i64;
#[cfg(not(all(target_arch = "x86_64", target_pointer_width = "32")))]
#[allow(non_camel_case_types)]
type tv_nsec_t = libc::c_long;

fn convert_timeout(timeout: Option<Duration>) -> Option<libc::timespec> {
    match timeout {
        Some(duration) => {
            if duration.as_secs() > libc::time_t::MAX as u64 {
                return None;
            }
            Some(libc::timespec {
                tv_sec: duration.as_secs() as libc::time_t,
                tv_nsec: duration.subsec_nanos() as tv_nsec_t,
            })
        }
        None => None,
    }
}
