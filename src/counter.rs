//! Sharded statistics counters.
//!
//! All of these trade read cost for write scalability: every thread counts
//! into a cell of its own (one cache line, single writer, relaxed atomics
//! that compile to plain loads and stores), and a read folds all cells. Use
//! them where writes vastly outnumber reads.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicI64, AtomicPtr, AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::tls::LeakyEnumerableThreadLocal;
use crate::utils::CacheAligned;

/// Distributed equivalent of `AtomicI64::fetch_add` + `load`.
pub struct ConcurrentAdder {
    storage: LeakyEnumerableThreadLocal<CacheAligned<AtomicI64>>,
}

impl ConcurrentAdder {
    pub fn new() -> Self {
        ConcurrentAdder {
            storage: LeakyEnumerableThreadLocal::new(),
        }
    }

    #[inline]
    pub fn add(&self, value: i64) {
        let local = self.storage.local();
        // The cell's only writer is this thread; a relaxed read-modify-write
        // without atomicity of the whole pair is enough.
        local.store(local.load(Ordering::Relaxed).wrapping_add(value), Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        let mut sum = 0i64;
        self.storage.for_each(|cells| {
            for cell in cells {
                sum = sum.wrapping_add(cell.load(Ordering::Relaxed));
            }
        });
        sum
    }

    pub fn reset(&mut self) {
        self.storage.for_each(|cells| {
            for cell in cells {
                cell.store(0, Ordering::Relaxed);
            }
        });
    }
}

impl Default for ConcurrentAdder {
    fn default() -> Self {
        ConcurrentAdder::new()
    }
}

struct ExtremumSlot {
    version: AtomicU64,
    value: AtomicI64,
}

impl Default for ExtremumSlot {
    fn default() -> Self {
        ExtremumSlot {
            version: AtomicU64::new(u64::MAX),
            value: AtomicI64::new(0),
        }
    }
}

/// Distributed max (`MAX = true`) or min (`MAX = false`) tracker.
///
/// Reset does not touch the cells: it bumps a global period counter, and
/// samples stamped with an older period are ignored on read. A count racing
/// with the period bump may land in the closing period and go unreported;
/// for statistics this loss is negligible.
pub struct ConcurrentExtremum<const MAX: bool> {
    storage: LeakyEnumerableThreadLocal<CacheAligned<ExtremumSlot>>,
    version: AtomicU64,
}

pub type ConcurrentMaxer = ConcurrentExtremum<true>;
pub type ConcurrentMiner = ConcurrentExtremum<false>;

impl<const MAX: bool> ConcurrentExtremum<MAX> {
    pub fn new() -> Self {
        ConcurrentExtremum {
            storage: LeakyEnumerableThreadLocal::new(),
            version: AtomicU64::new(0),
        }
    }

    fn better(challenger: i64, incumbent: i64) -> bool {
        if MAX {
            challenger > incumbent
        } else {
            challenger < incumbent
        }
    }

    #[inline]
    pub fn record(&self, value: i64) {
        let slot = &**self.storage.local();
        let version = self.version.load(Ordering::Relaxed);
        if slot.version.load(Ordering::Relaxed) != version {
            slot.value.store(value, Ordering::Relaxed);
            slot.version.store(version, Ordering::Relaxed);
            return;
        }
        if Self::better(value, slot.value.load(Ordering::Relaxed)) {
            slot.value.store(value, Ordering::Relaxed);
        }
    }

    /// Extremum of the current period, or `None` when nothing was recorded.
    pub fn try_value(&self) -> Option<i64> {
        let version = self.version.load(Ordering::Relaxed);
        let mut result: Option<i64> = None;
        self.storage.for_each(|slots| {
            for slot in slots {
                if slot.version.load(Ordering::Relaxed) != version {
                    continue;
                }
                let value = slot.value.load(Ordering::Relaxed);
                if result.map_or(true, |best| Self::better(value, best)) {
                    result = Some(value);
                }
            }
        });
        result
    }

    /// Extremum of the current period, or 0 when nothing was recorded.
    pub fn value(&self) -> i64 {
        self.try_value().unwrap_or(0)
    }

    /// Open a new period.
    pub fn reset(&self) {
        self.version.fetch_add(1, Ordering::Relaxed);
    }
}

impl<const MAX: bool> Default for ConcurrentExtremum<MAX> {
    fn default() -> Self {
        ConcurrentExtremum::new()
    }
}

/// Counting result pair: running total and number of counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Summary {
    pub sum: i64,
    pub num: u64,
}

struct SummerCell(UnsafeCell<Summary>);

// Written only by the owning thread via single 16-byte stores; readers rely
// on aligned 16-byte load/store atomicity of the target CPUs.
unsafe impl Sync for SummerCell {}

impl Default for SummerCell {
    fn default() -> Self {
        SummerCell(UnsafeCell::new(Summary::default()))
    }
}

/// Distributed equivalent of `lock { sum += value; num += 1 }`.
pub struct ConcurrentSummer {
    storage: LeakyEnumerableThreadLocal<CacheAligned<SummerCell>>,
}

impl ConcurrentSummer {
    pub fn new() -> Self {
        ConcurrentSummer {
            storage: LeakyEnumerableThreadLocal::new(),
        }
    }

    #[inline]
    pub fn add(&self, value: i64) {
        self.add_summary(Summary { sum: value, num: 1 });
    }

    #[inline]
    pub fn add_summary(&self, summary: Summary) {
        let cell = self.storage.local().0 .0.get();
        unsafe { store_summed(cell, summary) };
    }

    pub fn value(&self) -> Summary {
        let mut total = Summary::default();
        self.storage.for_each(|cells| {
            for cell in cells {
                let value = unsafe { load_atomic_16(cell.0 .0.get()) };
                total.sum = total.sum.wrapping_add(value.sum);
                total.num = total.num.wrapping_add(value.num);
            }
        });
        total
    }
}

impl Default for ConcurrentSummer {
    fn default() -> Self {
        ConcurrentSummer::new()
    }
}

// Neither Intel nor AMD formally promise atomicity for 128-bit accesses,
// but on current server cores an aligned 16-byte load/store inside one
// cache line is (see https://rigtorp.se/isatomic/). Armv8.4-A makes the
// same guarantee architectural. Issuing the access as one SIMD instruction
// keeps the {sum, num} pair from tearing under concurrent readers.
#[cfg(target_arch = "x86_64")]
unsafe fn store_summed(cell: *mut Summary, delta: Summary) {
    use core::arch::x86_64::*;
    let delta = _mm_load_si128(&delta as *const Summary as *const __m128i);
    let local = _mm_load_si128(cell as *const __m128i);
    _mm_store_si128(cell as *mut __m128i, _mm_add_epi64(local, delta));
}

#[cfg(target_arch = "x86_64")]
unsafe fn load_atomic_16(cell: *const Summary) -> Summary {
    use core::arch::x86_64::*;
    let mut out = Summary::default();
    let value = _mm_load_si128(cell as *const __m128i);
    _mm_store_si128(&mut out as *mut Summary as *mut __m128i, value);
    out
}

#[cfg(target_arch = "aarch64")]
unsafe fn store_summed(cell: *mut Summary, delta: Summary) {
    use core::arch::aarch64::*;
    let delta = vld1q_s64(&delta as *const Summary as *const i64);
    let local = vld1q_s64(cell as *const i64);
    vst1q_s64(cell as *mut i64, vaddq_s64(local, delta));
}

#[cfg(target_arch = "aarch64")]
unsafe fn load_atomic_16(cell: *const Summary) -> Summary {
    use core::arch::aarch64::*;
    let mut out = Summary::default();
    let value = vld1q_s64(cell as *const i64);
    vst1q_s64(&mut out as *mut Summary as *mut i64, value);
    out
}

// Plain fallback: the pair may tear between `sum` and `num` under a
// concurrent read. Only targets without 16-byte SIMD stores take this path.
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn store_summed(cell: *mut Summary, delta: Summary) {
    let local = cell.read_volatile();
    cell.write_volatile(Summary {
        sum: local.sum.wrapping_add(delta.sum),
        num: local.num.wrapping_add(delta.num),
    });
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
unsafe fn load_atomic_16(cell: *const Summary) -> Summary {
    cell.read_volatile()
}

const SAMPLE_BUCKET_NUM: usize = 31;
const DEFAULT_BUCKET_CAPACITY: u16 = 30;

/// One value-range reservoir of a [`ConcurrentSampler`].
pub struct SampleBucket {
    capacity: AtomicU16,
    record_num: AtomicU32,
    data: Box<[AtomicU32]>,
}

impl SampleBucket {
    fn with_capacity(capacity: u16) -> Self {
        let mut data = Vec::with_capacity(capacity as usize);
        data.resize_with(capacity as usize, || AtomicU32::new(0));
        SampleBucket {
            capacity: AtomicU16::new(capacity),
            record_num: AtomicU32::new(0),
            data: data.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed) as usize
    }

    /// How many values were offered, including ones the reservoir dropped.
    pub fn record_num(&self) -> usize {
        self.record_num.load(Ordering::Acquire) as usize
    }

    /// How many samples are actually retained.
    pub fn len(&self) -> usize {
        self.record_num().min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.data[..self.len()]
            .iter()
            .map(|value| value.load(Ordering::Relaxed))
    }
}

struct Sample {
    version: AtomicU32,
    non_empty_bucket_mask: AtomicU32,
    buckets: [AtomicPtr<SampleBucket>; SAMPLE_BUCKET_NUM],
}

impl Default for Sample {
    fn default() -> Self {
        Sample {
            version: AtomicU32::new(0),
            non_empty_bucket_mask: AtomicU32::new(0),
            buckets: [(); SAMPLE_BUCKET_NUM].map(|_| AtomicPtr::new(core::ptr::null_mut())),
        }
    }
}

impl Drop for Sample {
    fn drop(&mut self) {
        for bucket in &self.buckets {
            let ptr = bucket.load(Ordering::Relaxed);
            if !ptr.is_null() {
                drop(unsafe { Box::from_raw(ptr) });
            }
        }
    }
}

/// Distributed reservoir sampler over power-of-two value ranges.
///
/// Values are bucketed by `log2`: `[0, 2)` into bucket 0, `[2^k, 2^k+1)`
/// into bucket `k`, everything at and above `2^31` into bucket 30. Each
/// thread keeps its own reservoirs; a read visits them all.
pub struct ConcurrentSampler {
    storage: LeakyEnumerableThreadLocal<Sample>,
    bucket_capacity: [AtomicU16; SAMPLE_BUCKET_NUM],
    version: AtomicU32,
}

impl ConcurrentSampler {
    pub fn new() -> Self {
        ConcurrentSampler {
            storage: LeakyEnumerableThreadLocal::new(),
            bucket_capacity: [(); SAMPLE_BUCKET_NUM]
                .map(|_| AtomicU16::new(DEFAULT_BUCKET_CAPACITY)),
            version: AtomicU32::new(0),
        }
    }

    pub fn bucket_index(value: u32) -> usize {
        let value = (value & 0x7FFF_FFFF) >> 1;
        if value == 0 {
            0
        } else {
            32 - value.leading_zeros() as usize
        }
    }

    /// Change a bucket's reservoir capacity. Applied when the owning threads
    /// next touch the bucket in a fresh period.
    pub fn set_bucket_capacity(&self, index: usize, capacity: u16) {
        self.bucket_capacity[index].store(capacity.max(1), Ordering::Relaxed);
    }

    pub fn bucket_capacity(&self, index: usize) -> usize {
        self.bucket_capacity[index].load(Ordering::Relaxed) as usize
    }

    pub fn record(&self, value: u32) {
        let sample = self.storage.local();
        let version = self.version.load(Ordering::Acquire);
        if sample.version.load(Ordering::Relaxed) != version {
            // New period: forget the previous period's contents.
            sample.non_empty_bucket_mask.store(0, Ordering::Relaxed);
            for bucket in &sample.buckets {
                let ptr = bucket.load(Ordering::Relaxed);
                if !ptr.is_null() {
                    unsafe { (*ptr).record_num.store(0, Ordering::Relaxed) };
                }
            }
            sample.version.store(version, Ordering::Release);
        }
        let index = Self::bucket_index(value);
        let bucket = self.prepare_sample_bucket(sample, index);
        let n = bucket.record_num.fetch_add(1, Ordering::AcqRel);
        let capacity = bucket.capacity.load(Ordering::Relaxed) as u32;
        let slot = if n < capacity {
            Some(n)
        } else {
            // Uniform reservoir replacement keeps every offered value
            // equally likely to be retained.
            let r = xorshift128_rand() as u32 % (n + 1);
            (r < capacity).then_some(r)
        };
        if let Some(slot) = slot {
            bucket.data[slot as usize].store(value, Ordering::Relaxed);
        }
        if sample.non_empty_bucket_mask.load(Ordering::Relaxed) & (1 << index) == 0 {
            sample
                .non_empty_bucket_mask
                .fetch_or(1 << index, Ordering::Release);
        }
    }

    /// Visit every thread's non-empty buckets of the current period as
    /// `callback(bucket_index, bucket)`.
    pub fn for_each<F: FnMut(usize, &SampleBucket)>(&self, mut callback: F) {
        let version = self.version.load(Ordering::Relaxed);
        self.storage.for_each(|samples| {
            for sample in samples {
                if sample.version.load(Ordering::Acquire) != version {
                    continue;
                }
                let mut mask = sample.non_empty_bucket_mask.load(Ordering::Acquire);
                while mask != 0 {
                    let index = mask.trailing_zeros() as usize;
                    mask &= mask - 1;
                    let bucket = sample.buckets[index].load(Ordering::Acquire);
                    if !bucket.is_null() {
                        callback(index, unsafe { &*bucket });
                    }
                }
            }
        });
    }

    /// Logically drop all accumulated samples by opening a new period.
    pub fn reset(&self) {
        self.version.fetch_add(1, Ordering::Release);
    }

    fn prepare_sample_bucket<'a>(&self, sample: &'a Sample, index: usize) -> &'a SampleBucket {
        let want = self.bucket_capacity[index].load(Ordering::Relaxed);
        let ptr = sample.buckets[index].load(Ordering::Relaxed);
        if !ptr.is_null() {
            let bucket = unsafe { &*ptr };
            if bucket.data.len() >= want as usize {
                // Allocation still fits; shrink or grow the logical capacity
                // in place.
                if bucket.capacity.load(Ordering::Relaxed) != want {
                    bucket.capacity.store(want, Ordering::Relaxed);
                }
                return bucket;
            }
        }
        let new_bucket = Box::into_raw(Box::new(SampleBucket::with_capacity(want)));
        let old = sample.buckets[index].swap(new_bucket, Ordering::AcqRel);
        if !old.is_null() {
            drop(unsafe { Box::from_raw(old) });
        }
        unsafe { &*new_bucket }
    }
}

impl Default for ConcurrentSampler {
    fn default() -> Self {
        ConcurrentSampler::new()
    }
}

fn xorshift128_rand() -> u16 {
    use core::cell::Cell;
    thread_local! {
        static SEED: Cell<[u64; 2]> = const { Cell::new([1, 1]) };
        static VALUE: Cell<u64> = const { Cell::new(0) };
    }
    VALUE.with(|value| {
        let mut v = value.get();
        if v == 0 {
            SEED.with(|seed| {
                let [mut s1, s0] = seed.get();
                s1 ^= s1 << 23;
                s1 = s1 ^ s0 ^ (s1 >> 18) ^ (s0 >> 5);
                seed.set([s0, s1]);
                v = s1.wrapping_add(s0);
            });
        }
        let result = v as u16;
        value.set(v >> 16);
        result
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn adder_accumulates_across_threads() {
        let adder = Arc::new(ConcurrentAdder::new());
        let barrier = Arc::new(Barrier::new(4));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let adder = adder.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..10000 {
                        adder.add(1);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(adder.value(), 40000);
        let mut adder = Arc::try_unwrap(adder).ok().unwrap();
        adder.reset();
        assert_eq!(adder.value(), 0);
    }

    #[test]
    fn adder_supports_negative_values() {
        let adder = ConcurrentAdder::new();
        adder.add(10);
        adder.add(-30);
        assert_eq!(adder.value(), -20);
    }

    #[test]
    fn maxer_reports_period_maximum() {
        let maxer = ConcurrentMaxer::new();
        assert_eq!(maxer.try_value(), None);
        maxer.record(-5);
        maxer.record(9);
        maxer.record(3);
        assert_eq!(maxer.value(), 9);
        maxer.reset();
        assert_eq!(maxer.try_value(), None);
        maxer.record(-1);
        assert_eq!(maxer.value(), -1);
    }

    #[test]
    fn miner_reports_period_minimum() {
        let miner = ConcurrentMiner::new();
        miner.record(5);
        miner.record(-9);
        miner.record(3);
        assert_eq!(miner.value(), -9);
    }

    #[test]
    fn summer_counts_sum_and_num() {
        let summer = Arc::new(ConcurrentSummer::new());
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let summer = summer.clone();
                thread::spawn(move || {
                    for i in 0..1000i64 {
                        summer.add(i + t);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        let summary = summer.value();
        assert_eq!(summary.num, 4000);
        assert_eq!(summary.sum, 4 * 499_500 + 1000 * (0 + 1 + 2 + 3));
    }

    #[test]
    fn sampler_bucket_index_is_log2() {
        assert_eq!(ConcurrentSampler::bucket_index(0), 0);
        assert_eq!(ConcurrentSampler::bucket_index(1), 0);
        assert_eq!(ConcurrentSampler::bucket_index(2), 1);
        assert_eq!(ConcurrentSampler::bucket_index(3), 1);
        assert_eq!(ConcurrentSampler::bucket_index(4), 2);
        assert_eq!(ConcurrentSampler::bucket_index(1 << 30), 30);
        assert_eq!(ConcurrentSampler::bucket_index(u32::MAX), 30);
    }

    #[test]
    fn sampler_retains_everything_under_capacity() {
        let sampler = ConcurrentSampler::new();
        for value in [16u32, 17, 18] {
            sampler.record(value);
        }
        let mut collected = Vec::new();
        sampler.for_each(|index, bucket| {
            assert_eq!(index, 4);
            assert_eq!(bucket.record_num(), 3);
            collected.extend(bucket.iter());
        });
        collected.sort_unstable();
        assert_eq!(collected, vec![16, 17, 18]);
    }

    #[test]
    fn sampler_caps_retained_samples() {
        let sampler = ConcurrentSampler::new();
        sampler.set_bucket_capacity(0, 8);
        for _ in 0..1000 {
            sampler.record(1);
        }
        let mut total = 0;
        sampler.for_each(|index, bucket| {
            assert_eq!(index, 0);
            assert_eq!(bucket.record_num(), 1000);
            total += bucket.len();
        });
        assert_eq!(total, 8);
    }

    #[test]
    fn sampler_reset_opens_empty_period() {
        let sampler = ConcurrentSampler::new();
        sampler.record(100);
        sampler.reset();
        let mut buckets = 0;
        sampler.for_each(|_, _| buckets += 1);
        assert_eq!(buckets, 0);
        // Recording again rebuilds the current period.
        sampler.record(7);
        sampler.for_each(|index, bucket| {
            assert_eq!(index, 2);
            assert_eq!(bucket.len(), 1);
        });
    }
}
