//! Hash functors used to map keys onto buckets.
//!
//! The table calls a functor once per serviced key and derives the bucket as
//! `hash(key) % num_buckets`, so implementations must be pure and
//! deterministic for the lifetime of a table. Seeding (where supported) is
//! carried by the functor value itself, e.g. `XXHash32::new(seed)`.

use cust_core::DeviceCopy;

/// A pure function of the key producing a 32-bit value.
///
/// Implementations must be callable from both host and device code and
/// cheaply copyable into each lane's registers.
pub trait BucketHash<Key>: Copy + DeviceCopy {
    fn hash(&self, key: &Key) -> u32;
}

pub mod identity;
pub mod xxhash;

pub use identity::IdentityHash;
pub use xxhash::XXHash32;
