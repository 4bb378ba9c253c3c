//! Shared host/device core of the warp-cooperative slab hash table.
//!
//! This crate compiles two ways, like the rest of the launch stack expects:
//! - For the host: a regular Rust library. The bulk operations run on a
//!   software-SIMT executor (32 lockstep lane threads per warp), so the
//!   whole protocol is exercised without a GPU.
//! - For `nvptx64-nvidia-cuda`: PTX via `cargo xtask ptx`, exposing
//!   the `#[kernel]` entry points in [`slab_hash`].
//!
//! The table itself: one head slab per bucket, collision chains of 32-word
//! slabs, pair records behind 32-bit index handles, and three bulk
//! operations (insert / search / remove) executed as warp-cooperative state
//! machines over single-word CAS.

#[cfg(not(target_arch = "nvptx64"))]
pub mod error;
pub mod hash;
pub mod packed;
pub mod pair;
pub mod pair_alloc;
pub mod slab_alloc;
pub mod slab_hash;
pub mod slab_hash_ref;
pub mod storage;
pub mod warp;

#[cfg(all(feature = "cuda", not(target_arch = "nvptx64")))]
pub mod cuda;

#[cfg(not(target_arch = "nvptx64"))]
pub use error::Error;
pub use hash::{BucketHash, IdentityHash, XXHash32};
pub use pair::Pair;
pub use pair_alloc::EMPTY_PAIR;
pub use slab_alloc::{EMPTY_SLAB, HEAD_SLAB};
#[cfg(not(target_arch = "nvptx64"))]
pub use packed::PackedSlabHash;
pub use packed::{PackedSlabHashRef, EMPTY_PAIR_PACKED};
#[cfg(not(target_arch = "nvptx64"))]
pub use slab_hash::{SlabHash, SlabHashOptions};
pub use slab_hash_ref::SlabHashRef;
