//! Slab Hash - a concurrent hash table for warp-cooperative SIMT execution.
//!
//! The table lives entirely in "device" memory and is manipulated by warps
//! of 32 lanes working one query at a time: bulk Insert / Search / Remove
//! batches fan out one lane per key, and every mutation lands through a
//! single-word compare-and-swap. Collisions chain fixed 32-word slabs from
//! a per-bucket head slab; records sit behind 32-bit index handles (or
//! inline, in the packed variant).
//!
//! Two execution routes share the same protocol code: the default build
//! runs batches on a software-SIMT executor (32 lockstep lane threads per
//! warp), and the `cuda` feature adds a cust-backed facade that launches
//! the PTX kernels produced by `cargo xtask ptx`.

pub mod slab_hash;

// Re-export main types
pub use slab_hash_kernels::hash::{BucketHash, IdentityHash, XXHash32};
pub use slab_hash_kernels::packed::SlotBits;
pub use slab_hash_kernels::{
    Error, PackedSlabHash, PackedSlabHashRef, Pair, SlabHash, SlabHashOptions, SlabHashRef,
    EMPTY_PAIR, EMPTY_PAIR_PACKED, EMPTY_SLAB, HEAD_SLAB,
};

#[cfg(feature = "cuda")]
pub use slab_hash_kernels::cuda::DeviceSlabHash;
