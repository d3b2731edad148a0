//! Lock-free concurrent containers and primitives built over raw futexes.
//!
//! The pieces stack: a pluggable [`sched`] layer wraps the OS futex; the
//! [`queue`] blocks through it; the [`vector`] grows lock-free and retires
//! old lookup tables through [`retire`]; [`tls`] builds enumerable
//! thread-local storage over the vector; [`counter`] shards statistics over
//! that storage; [`swiss`] and [`transient`] provide concurrent
//! insert-and-lookup hash tables; [`epoch`] and [`gc`] tie deferred
//! destruction to reader critical sections, funneled through the queue.

pub mod counter;
pub mod epoch;
pub mod gc;
pub mod queue;
pub mod retire;
pub mod sched;
pub mod swiss;
pub mod thread_id;
pub mod tls;
pub mod transient;
mod utils;
pub mod vector;

pub use counter::{
    ConcurrentAdder, ConcurrentMaxer, ConcurrentMiner, ConcurrentSampler, ConcurrentSummer,
    Summary,
};
pub use epoch::{Epoch, EpochGuard};
pub use gc::GarbageCollector;
pub use queue::ConcurrentBoundedQueue;
pub use retire::RetireList;
pub use sched::{DefaultSched, Errno, SchedInterface, SpinSched};
pub use swiss::{ConcurrentFixedSwissTable, IdentityKeyExtractor, Insert, KeyExtractor,
    PairKeyExtractor};
pub use thread_id::IdAllocator;
pub use tls::{EnumerableThreadLocal, LeakyEnumerableThreadLocal};
pub use transient::{ConcurrentTransientHashMap, ConcurrentTransientHashSet};
pub use utils::CacheAligned;
pub use vector::ConcurrentVector;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub use sched::KernelSched;
