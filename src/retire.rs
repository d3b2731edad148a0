//! Time-based retirement list.
//!
//! Compared to a typical epoch-locked scheme this drops every reader-side
//! marking action: safety comes from requiring a long cool-down between
//! retiring an object and freeing it. Reclaim is therefore very untimely,
//! which is fine for the block tables it protects — readers hold them for
//! microseconds and the tables are few and large.

use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::utils::coarse_monotonic_timestamp;

struct Node<T> {
    data: *mut T,
    next: *mut Node<T>,
}

/// Single-linked list of retired objects, reclaimed by wall-clock age.
///
/// The head word packs `{timestamp: u16, node: 48-bit pointer}`. Ownership of
/// retired boxes moves into the list; they are dropped in `gc`, in a `retire`
/// that finds the list expired, or on drop of the list itself.
pub struct RetireList<T> {
    head: AtomicU64,
    _marker: PhantomData<Box<T>>,
}

const NODE_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
const TIMESTAMP_SHIFT: u32 = 48;

unsafe impl<T: Send> Send for RetireList<T> {}
unsafe impl<T: Send> Sync for RetireList<T> {}

impl<T> RetireList<T> {
    pub const fn new() -> Self {
        RetireList {
            head: AtomicU64::new(0),
            _marker: PhantomData,
        }
    }

    /// Hand `data` to the list. It stays untouched until it has cooled down.
    ///
    /// If the current list is already expired, this thread swaps in a fresh
    /// list headed by the new node and frees the old one outside the
    /// critical section.
    pub fn retire(&self, data: Box<T>) {
        let node = Box::into_raw(Box::new(Node {
            data: Box::into_raw(data),
            next: ptr::null_mut(),
        }));
        debug_assert_eq!(node as u64 & !NODE_MASK, 0, "node pointer exceeds 48 bits");
        let mut head = self.head.load(Ordering::Acquire);
        let timestamp = coarse_monotonic_timestamp();
        let new_head = make_head(node, timestamp);
        if expired(head, timestamp) {
            if let Err(current) =
                self.head
                    .compare_exchange(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                head = current;
            } else {
                unsafe { delete_list::<T>(head) };
                return;
            }
        }
        loop {
            unsafe { (*node).next = node_of(head) };
            match self
                .head
                .compare_exchange_weak(head, new_head, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Free the accumulated list if it has been cold for long enough.
    pub fn gc(&self) {
        let head = self.head.load(Ordering::Acquire);
        let timestamp = coarse_monotonic_timestamp();
        if expired(head, timestamp)
            && self
                .head
                .compare_exchange(head, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            unsafe { delete_list::<T>(head) };
        }
    }

    /// Free the accumulated list without any age check.
    ///
    /// Exclusive access (no concurrent readers of retired objects) is
    /// guaranteed by the `&mut` receiver.
    pub fn unsafe_gc(&mut self) {
        let head = self.head.swap(0, Ordering::Relaxed);
        unsafe { delete_list::<T>(head) };
    }
}

impl<T> Drop for RetireList<T> {
    fn drop(&mut self) {
        unsafe { delete_list::<T>(self.head.load(Ordering::Relaxed)) };
    }
}

impl<T> Default for RetireList<T> {
    fn default() -> Self {
        RetireList::new()
    }
}

#[inline]
fn node_of<T>(head: u64) -> *mut Node<T> {
    (head & NODE_MASK) as *mut Node<T>
}

#[inline]
fn timestamp_of(head: u64) -> u16 {
    (head >> TIMESTAMP_SHIFT) as u16
}

#[inline]
fn make_head<T>(node: *mut Node<T>, timestamp: u16) -> u64 {
    ((timestamp as u64) << TIMESTAMP_SHIFT) | node as u64
}

// More than one 64-second unit old counts as expired. Requiring two units
// instead of one keeps a head that was stamped right before a unit boundary
// from looking old a moment later; expiry thus implies at least one full
// unit has passed. The u16 wraps once every ~49 days of uptime, causing a
// 2/65536 rate of missed (not unsafe) reclaims.
#[inline]
fn expired(head: u64, current_timestamp: u16) -> bool {
    current_timestamp.wrapping_sub(timestamp_of(head)) > 1
}

unsafe fn delete_list<T>(head: u64) {
    let mut node = node_of::<T>(head);
    while !node.is_null() {
        let boxed = Box::from_raw(node);
        drop(Box::from_raw(boxed.data));
        node = boxed.next;
    }
}
