//! CUDA-backed facade for the canonical `u32`/`u32` table (feature `cuda`).
//!
//! Owns device-resident pools and launches the PTX kernels compiled from
//! this crate (`cargo xtask ptx`). The caller initializes the CUDA
//! context on `options.device_index` (e.g. `cust::quick_init()` or
//! `Device::get_device(idx)`), loads the PTX into a [`Module`], and passes
//! stream and module into each bulk call, mirroring the launch flow used
//! throughout the host crate's tests.

use cust::launch;
use cust::memory::{CopyDestination, DeviceBuffer};
use cust::module::Module;
use cust::stream::Stream;

use crate::error::Error;
use crate::hash::XXHash32;
use crate::pair::Pair;
use crate::pair_alloc::PairAllocRef;
use crate::slab_alloc::{
    SlabAllocRef, MEM_BLOCKS_PER_SUPER_BLOCK, SLABS_PER_MEM_BLOCK, SLABS_PER_SUPER_BLOCK,
    SLAB_WORDS,
};
use crate::slab_hash::SlabHashOptions;
use crate::slab_hash_ref::SlabHashRef;
use crate::warp;

const BLOCK_SIZE: u32 = 128;

fn grid_for(threads: u32) -> u32 {
    threads.div_ceil(BLOCK_SIZE).max(1)
}

/// Device-resident slab hash over `u32` keys and values hashed by a seeded
/// [`XXHash32`].
pub struct DeviceSlabHash {
    num_buckets: u32,
    slab_capacity: u32,
    num_super_blocks: u32,
    pair_capacity: u32,
    hasher: XXHash32<u32>,
    bucket_heads: DeviceBuffer<u32>,
    bitmaps: DeviceBuffer<u32>,
    slabs: DeviceBuffer<u32>,
    heap: DeviceBuffer<u32>,
    heap_counter: DeviceBuffer<u32>,
    pairs: DeviceBuffer<Pair<u32, u32>>,
}

impl DeviceSlabHash {
    /// Allocates and all-ones-initializes the device pools. Keys are hashed
    /// by [`XXHash32`] seeded from `options.seed`.
    pub fn new(options: SlabHashOptions) -> Result<Self, Error> {
        let hasher = XXHash32::new(options.seed);
        let slab_capacity = options.validate()?;
        let num_super_blocks = slab_capacity.div_ceil(SLABS_PER_SUPER_BLOCK).max(1);

        let head_words = options.num_buckets as usize * warp::WARP_WIDTH as usize;
        let bucket_heads = DeviceBuffer::from_slice(&vec![u32::MAX; head_words])?;

        // Free bitmaps, with the tail past `slab_capacity` pre-marked used.
        let num_bitmaps = (num_super_blocks * MEM_BLOCKS_PER_SUPER_BLOCK) as usize;
        let mut host_bitmaps = vec![u32::MAX; num_bitmaps];
        for (index, bitmap) in host_bitmaps.iter_mut().enumerate() {
            let first_slab = index as u32 * SLABS_PER_MEM_BLOCK;
            let usable = slab_capacity
                .saturating_sub(first_slab)
                .min(SLABS_PER_MEM_BLOCK);
            *bitmap = if usable == 32 {
                u32::MAX
            } else {
                (1u32 << usable) - 1
            };
        }
        let bitmaps = DeviceBuffer::from_slice(&host_bitmaps)?;

        let slab_words =
            num_super_blocks as usize * SLABS_PER_SUPER_BLOCK as usize * SLAB_WORDS as usize;
        let slabs = DeviceBuffer::from_slice(&vec![u32::MAX; slab_words])?;

        let pair_capacity = options.max_keyvalue_count;
        let heap: Vec<u32> = (0..pair_capacity).collect();
        let heap = DeviceBuffer::from_slice(&heap)?;
        let heap_counter = DeviceBuffer::from_slice(&[0u32])?;
        // Safety: records are written by inserting lanes before their index
        // is ever published into a slot, so no kernel reads them
        // uninitialized.
        let pairs = unsafe { DeviceBuffer::uninitialized(pair_capacity as usize)? };

        Ok(Self {
            num_buckets: options.num_buckets,
            slab_capacity,
            num_super_blocks,
            pair_capacity,
            hasher,
            bucket_heads,
            bitmaps,
            slabs,
            heap,
            heap_counter,
            pairs,
        })
    }

    /// Kernel-ready handle over the device pools.
    fn device_ref(&self) -> SlabHashRef<u32, u32, XXHash32<u32>> {
        // Safety: the device buffers match the extents the ref constructors
        // require, are initialized (see `new`), and live as long as `self`;
        // cudaMalloc alignment covers 4-byte words.
        unsafe {
            let slab_alloc = SlabAllocRef::new(
                self.num_super_blocks,
                self.bitmaps.as_device_ptr().as_raw() as *mut u32,
                self.slabs.as_device_ptr().as_raw() as *mut u32,
            );
            let pair_alloc = PairAllocRef::new(
                self.pair_capacity,
                self.heap.as_device_ptr().as_raw() as *mut u32,
                self.heap_counter.as_device_ptr().as_raw() as *mut u32,
                self.pairs.as_device_ptr().as_raw() as *mut Pair<u32, u32>,
            );
            SlabHashRef::new(
                self.num_buckets,
                self.hasher,
                self.bucket_heads.as_device_ptr().as_raw() as *mut u32,
                slab_alloc,
                pair_alloc,
            )
        }
    }

    /// Bulk insert-if-absent.
    pub fn insert(
        &mut self,
        keys: &[u32],
        values: &[u32],
        stream: &Stream,
        module: &Module,
    ) -> Result<(), Error> {
        if keys.len() != values.len() {
            return Err(Error::LengthMismatch {
                keys: keys.len(),
                outputs: values.len(),
            });
        }
        if keys.is_empty() {
            return Ok(());
        }
        let n = keys.len() as u32;
        let keys_buf = DeviceBuffer::from_slice(keys)?;
        let values_buf = DeviceBuffer::from_slice(values)?;
        let kernel = module.get_function("slab_hash_insert_u32")?;
        let table = self.device_ref();
        // Safety: kernel pointer arguments stay alive until the synchronize
        // below; `table` refers to buffers owned by `self`.
        unsafe {
            launch!(kernel<<<grid_for(n), BLOCK_SIZE, 0, stream>>>(
                table,
                keys_buf.as_device_ptr().as_raw(),
                values_buf.as_device_ptr().as_raw(),
                n
            ))?;
        }
        stream.synchronize()?;
        Ok(())
    }

    /// Bulk search: byte flags plus values (`empty_value` when absent).
    pub fn search(
        &self,
        keys: &[u32],
        values: &mut [u32],
        founds: &mut [u8],
        empty_value: u32,
        stream: &Stream,
        module: &Module,
    ) -> Result<(), Error> {
        if keys.len() != values.len() {
            return Err(Error::LengthMismatch {
                keys: keys.len(),
                outputs: values.len(),
            });
        }
        if keys.len() != founds.len() {
            return Err(Error::LengthMismatch {
                keys: keys.len(),
                outputs: founds.len(),
            });
        }
        if keys.is_empty() {
            return Ok(());
        }
        let n = keys.len() as u32;
        let keys_buf = DeviceBuffer::from_slice(keys)?;
        // Safety: every element is written by the kernel before the copy
        // back (inactive trailing lanes never map to an output index).
        let values_buf: DeviceBuffer<u32> = unsafe { DeviceBuffer::uninitialized(keys.len())? };
        let founds_buf: DeviceBuffer<u8> = unsafe { DeviceBuffer::uninitialized(keys.len())? };
        let kernel = module.get_function("slab_hash_search_u32")?;
        let table = self.device_ref();
        // Safety: as in `insert`.
        unsafe {
            launch!(kernel<<<grid_for(n), BLOCK_SIZE, 0, stream>>>(
                table,
                keys_buf.as_device_ptr().as_raw(),
                values_buf.as_device_ptr().as_raw(),
                founds_buf.as_device_ptr().as_raw(),
                empty_value,
                n
            ))?;
        }
        stream.synchronize()?;
        values_buf.copy_to(values)?;
        founds_buf.copy_to(founds)?;
        Ok(())
    }

    /// Bulk remove-if-present.
    pub fn remove(&mut self, keys: &[u32], stream: &Stream, module: &Module) -> Result<(), Error> {
        if keys.is_empty() {
            return Ok(());
        }
        let n = keys.len() as u32;
        let keys_buf = DeviceBuffer::from_slice(keys)?;
        let kernel = module.get_function("slab_hash_remove_u32")?;
        let table = self.device_ref();
        // Safety: as in `insert`.
        unsafe {
            launch!(kernel<<<grid_for(n), BLOCK_SIZE, 0, stream>>>(
                table,
                keys_buf.as_device_ptr().as_raw(),
                n
            ))?;
        }
        stream.synchronize()?;
        Ok(())
    }

    /// Live pair bytes divided by allocated slab bytes; one warp per bucket
    /// for the occupancy pass, one thread per bitmap for the fill pass.
    pub fn compute_load_factor(&self, stream: &Stream, module: &Module) -> Result<f64, Error> {
        let counts_buf = DeviceBuffer::from_slice(&vec![0u32; self.num_buckets as usize])?;
        let count_kernel = module.get_function("slab_hash_bucket_count_u32")?;
        let table = self.device_ref();
        let count_threads = self.num_buckets * warp::WARP_WIDTH;
        // Safety: as in `insert`.
        unsafe {
            launch!(count_kernel<<<grid_for(count_threads), BLOCK_SIZE, 0, stream>>>(
                table,
                counts_buf.as_device_ptr().as_raw(),
                self.num_buckets
            ))?;
        }

        let free_buf = DeviceBuffer::from_slice(&[0u32])?;
        let fill_kernel = module.get_function("slab_hash_bitmap_fill_u32")?;
        let num_bitmaps = self.num_super_blocks * MEM_BLOCKS_PER_SUPER_BLOCK;
        // Safety: as in `insert`.
        unsafe {
            launch!(fill_kernel<<<grid_for(num_bitmaps), BLOCK_SIZE, 0, stream>>>(
                table,
                free_buf.as_device_ptr().as_raw()
            ))?;
        }
        stream.synchronize()?;

        let mut counts = vec![0u32; self.num_buckets as usize];
        counts_buf.copy_to(&mut counts)?;
        let elements: u64 = counts.iter().map(|&c| c as u64).sum();

        let mut free = [0u32];
        free_buf.copy_to(&mut free)?;
        let allocated = self.slab_capacity - free[0];

        let total_slabs = self.num_buckets as u64 + allocated as u64;
        let pair_bytes = (core::mem::size_of::<u32>() * 2) as u64;
        let slab_bytes = (warp::WARP_WIDTH as usize * core::mem::size_of::<u32>()) as u64;
        Ok((elements * pair_bytes) as f64 / (total_slabs * slab_bytes) as f64)
    }
}
