//! Host-side slab hash wrapper.
//!
//! The core table types are defined in the kernels crate and shared between
//! host and device builds; this module re-exports them and is the place for
//! host-only conveniences that do not belong next to device code.

pub use slab_hash_kernels::packed::PackedSlabHash;
pub use slab_hash_kernels::slab_hash::{SlabHash, SlabHashOptions};
