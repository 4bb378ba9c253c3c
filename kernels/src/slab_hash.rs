//! Host-facing slab hash table (index-addressed variant) and its device
//! kernels.
//!
//! The host type owns the bucket-head array and both allocator pools and
//! exposes the bulk operations. On the default build the batches run on the
//! software-SIMT executor in [`crate::warp`]; the kernels at the bottom of
//! this file are the `nvptx64` entry points for the canonical `u32`/`u32`
//! table (bulk device launches are provided for the canonical type only).

#[cfg(not(target_arch = "nvptx64"))]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(not(target_arch = "nvptx64"))]
use log::{debug, warn};

#[cfg(not(target_arch = "nvptx64"))]
use crate::error::Error;
#[cfg(not(target_arch = "nvptx64"))]
use crate::hash::{BucketHash, XXHash32};
#[cfg(not(target_arch = "nvptx64"))]
use crate::pair_alloc::PairAlloc;
#[cfg(not(target_arch = "nvptx64"))]
use crate::slab_alloc::SlabAlloc;
#[cfg(not(target_arch = "nvptx64"))]
use crate::slab_alloc::HEAD_SLAB;
#[cfg(not(target_arch = "nvptx64"))]
use crate::pair_alloc::EMPTY_PAIR;
#[cfg(not(target_arch = "nvptx64"))]
use crate::slab_hash_ref::SlabHashRef;
#[cfg(not(target_arch = "nvptx64"))]
use crate::storage::Storage;
use crate::warp;

#[cfg(not(target_arch = "nvptx64"))]
use cust_core::DeviceCopy;

/// Pair slots per slab (lanes 0..=30; lane 31 is the next-slab pointer).
pub const PAIRS_PER_SLAB: u32 = warp::WARP_WIDTH - 1;

/// Construction parameters. `num_buckets` and `max_keyvalue_count` are
/// fixed for the table's lifetime; `seed` parameterizes the default hash
/// functor (see [`SlabHash::with_default_hasher`]) and is ignored by tables
/// built with an explicit hasher, which carries its own; `max_slab_count`
/// defaults to enough chain slabs for `max_keyvalue_count` records and is
/// mainly an override for exhaustion testing; `device_index` selects the
/// accelerator for the cust-backed facade and is recorded (only) by the
/// software backend.
#[derive(Clone, Copy, Debug)]
#[cfg(not(target_arch = "nvptx64"))]
pub struct SlabHashOptions {
    pub num_buckets: u32,
    pub max_keyvalue_count: u32,
    pub device_index: u32,
    pub seed: u32,
    pub max_slab_count: Option<u32>,
}

#[cfg(not(target_arch = "nvptx64"))]
impl SlabHashOptions {
    pub fn new(num_buckets: u32, max_keyvalue_count: u32) -> Self {
        Self {
            num_buckets,
            max_keyvalue_count,
            device_index: 0,
            seed: 0,
            max_slab_count: None,
        }
    }

    pub fn device_index(mut self, device_index: u32) -> Self {
        self.device_index = device_index;
        self
    }

    pub fn seed(mut self, seed: u32) -> Self {
        self.seed = seed;
        self
    }

    pub fn max_slab_count(mut self, max_slab_count: u32) -> Self {
        self.max_slab_count = Some(max_slab_count);
        self
    }

    pub(crate) fn validate(&self) -> Result<u32, Error> {
        if self.num_buckets == 0 {
            return Err(Error::InvalidConfig("num_buckets must be non-zero"));
        }
        if self.max_keyvalue_count == 0 {
            return Err(Error::InvalidConfig("max_keyvalue_count must be non-zero"));
        }
        if self.max_keyvalue_count >= EMPTY_PAIR {
            return Err(Error::InvalidConfig(
                "max_keyvalue_count exceeds the 32-bit handle space",
            ));
        }
        let slab_count = self
            .max_slab_count
            .unwrap_or_else(|| self.max_keyvalue_count.div_ceil(PAIRS_PER_SLAB).max(1));
        if slab_count == 0 || slab_count >= HEAD_SLAB {
            return Err(Error::InvalidConfig(
                "max_slab_count outside the 32-bit handle space",
            ));
        }
        Ok(slab_count)
    }
}

/// The index-addressed slab hash table.
///
/// Bulk operations assign one lane per input key, rounded up to a warp;
/// lanes past the batch end run the protocol inactive and contribute only
/// their slab reads. Batches are best-effort under pool exhaustion: affected
/// keys report not-inserted, everything else lands normally.
#[cfg(not(target_arch = "nvptx64"))]
pub struct SlabHash<K, V, H> {
    num_buckets: u32,
    device_index: u32,
    hasher: H,
    bucket_heads: Storage<u32>,
    slab_alloc: SlabAlloc<u32>,
    pair_alloc: PairAlloc<K, V>,
}

#[cfg(not(target_arch = "nvptx64"))]
impl<K, V, H> SlabHash<K, V, H>
where
    K: DeviceCopy + Copy + PartialEq + Default + Send + Sync,
    V: DeviceCopy + Copy + Default + Send + Sync,
    H: BucketHash<K>,
{
    /// Builds an empty table. The hash functor carries its own seed (e.g.
    /// `XXHash32::new(seed)`) and must stay deterministic for the table's
    /// lifetime.
    pub fn new(options: SlabHashOptions, hasher: H) -> Result<Self, Error> {
        let slab_count = options.validate()?;
        debug!(
            "slab hash: {} buckets, {} pair records, {} chain slabs, device {}",
            options.num_buckets, options.max_keyvalue_count, slab_count, options.device_index
        );

        let head_words = options.num_buckets as usize * warp::WARP_WIDTH as usize;
        Ok(Self {
            num_buckets: options.num_buckets,
            device_index: options.device_index,
            hasher,
            bucket_heads: Storage::new(head_words, u32::MAX),
            slab_alloc: SlabAlloc::new(slab_count),
            pair_alloc: PairAlloc::new(options.max_keyvalue_count),
        })
    }

    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    /// Pair-pool capacity.
    pub fn max_keyvalue_count(&self) -> u32 {
        self.pair_alloc.capacity()
    }

    /// Records currently stored (pool fill).
    pub fn live_pairs(&self) -> u32 {
        self.pair_alloc.alloc_ref().live_records()
    }

    /// Trivially copyable handle for lane code and custom kernels.
    pub fn device_ref(&self) -> SlabHashRef<K, V, H> {
        // Safety: the owned storages match the extents `SlabHashRef::new`
        // requires, are all-ones initialized, and live as long as `self`.
        unsafe {
            SlabHashRef::new(
                self.num_buckets,
                self.hasher,
                self.bucket_heads.ptr(),
                self.slab_alloc.alloc_ref(),
                self.pair_alloc.alloc_ref(),
            )
        }
    }

    /// Bulk insert-if-absent. Returns the number of keys newly inserted;
    /// keys already present and keys dropped to pool exhaustion are counted
    /// out. Duplicate keys *within* the batch resolve to exactly one winner.
    pub fn insert(&mut self, keys: &[K], values: &[V]) -> Result<usize, Error> {
        if keys.len() != values.len() {
            return Err(Error::LengthMismatch {
                keys: keys.len(),
                outputs: values.len(),
            });
        }
        if keys.is_empty() {
            return Ok(0);
        }

        let n = keys.len();
        let chunks = n.div_ceil(warp::WARP_WIDTH as usize);
        let resident = resident_warps(chunks);
        let inserted = AtomicUsize::new(0);
        let table = self.device_ref();

        warp::launch(resident as u32, |warp_id, lane_id| {
            let mut table = table;
            table.init_allocator(warp_id * warp::WARP_WIDTH + lane_id, lane_id);
            let mut chunk = warp_id as usize;
            while chunk < chunks {
                let tid = chunk * warp::WARP_WIDTH as usize + lane_id as usize;
                let mut lane_active = tid < n;
                let (key, value) = if lane_active {
                    (keys[tid], values[tid])
                } else {
                    (K::default(), V::default())
                };
                let bucket_id = table.compute_bucket(&key);
                let (_, newly) = table.insert(&mut lane_active, lane_id, bucket_id, &key, &value);
                if newly {
                    inserted.fetch_add(1, Ordering::Relaxed);
                }
                chunk += resident;
            }
        });

        let inserted = inserted.into_inner();
        debug!("bulk insert: {} of {} keys newly inserted", inserted, n);
        if inserted < n && self.live_pairs() >= self.pair_alloc.capacity() {
            warn!(
                "pair pool exhausted during bulk insert ({} records)",
                self.pair_alloc.capacity()
            );
        }
        Ok(inserted)
    }

    /// Bulk search. For key `i`, sets `founds[i] = 1` and `values[i]` to the
    /// stored value when present, else `founds[i] = 0` and the default
    /// value.
    pub fn search(&self, keys: &[K], values: &mut [V], founds: &mut [u8]) -> Result<(), Error> {
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

        let n = keys.len();
        let chunks = n.div_ceil(warp::WARP_WIDTH as usize);
        let resident = resident_warps(chunks);
        let values_out = SendPtr(values.as_mut_ptr());
        let founds_out = SendPtr(founds.as_mut_ptr());
        let table = self.device_ref();

        warp::launch(resident as u32, |warp_id, lane_id| {
            let values_out = values_out;
            let founds_out = founds_out;
            let mut table = table;
            table.init_allocator(warp_id * warp::WARP_WIDTH + lane_id, lane_id);
            let mut chunk = warp_id as usize;
            while chunk < chunks {
                let tid = chunk * warp::WARP_WIDTH as usize + lane_id as usize;
                let mut lane_active = tid < n;
                let key = if lane_active { keys[tid] } else { K::default() };
                let bucket_id = table.compute_bucket(&key);
                let (pair, found) = table.search(&mut lane_active, lane_id, bucket_id, &key);
                if tid < n {
                    let value = if found {
                        // Safety: `pair` was observed in a slot word after
                        // its publication CAS.
                        unsafe { table.pair_alloc().extract(pair) }.second
                    } else {
                        V::default()
                    };
                    // Safety: each tid is written by exactly one lane, and
                    // the output slices outlive the launch scope.
                    unsafe {
                        *values_out.0.add(tid) = value;
                        *founds_out.0.add(tid) = found as u8;
                    }
                }
                chunk += resident;
            }
        });

        Ok(())
    }

    /// Bulk remove-if-present. Returns the number of keys removed; absent
    /// keys are no-ops.
    pub fn remove(&mut self, keys: &[K]) -> Result<usize, Error> {
        if keys.is_empty() {
            return Ok(0);
        }

        let n = keys.len();
        let chunks = n.div_ceil(warp::WARP_WIDTH as usize);
        let resident = resident_warps(chunks);
        let removed = AtomicUsize::new(0);
        let table = self.device_ref();

        warp::launch(resident as u32, |warp_id, lane_id| {
            let mut table = table;
            table.init_allocator(warp_id * warp::WARP_WIDTH + lane_id, lane_id);
            let mut chunk = warp_id as usize;
            while chunk < chunks {
                let tid = chunk * warp::WARP_WIDTH as usize + lane_id as usize;
                let mut lane_active = tid < n;
                let key = if lane_active { keys[tid] } else { K::default() };
                let bucket_id = table.compute_bucket(&key);
                if table.remove(&mut lane_active, lane_id, bucket_id, &key) {
                    removed.fetch_add(1, Ordering::Relaxed);
                }
                chunk += resident;
            }
        });

        let removed = removed.into_inner();
        debug!("bulk remove: {} of {} keys removed", removed, n);
        Ok(removed)
    }

    /// Live pair bytes divided by allocated slab bytes.
    ///
    /// Pass 1 walks every bucket chain with one warp per bucket and
    /// popcounts live pair slots; pass 2 popcounts the allocator bitmaps.
    /// The denominator counts head slabs plus all currently-allocated chain
    /// slabs (chains are never shortened by Remove).
    pub fn compute_load_factor(&self) -> f64 {
        let buckets = self.num_buckets as usize;
        let resident = resident_warps(buckets);
        let elements = AtomicUsize::new(0);
        let table = self.device_ref();

        warp::launch(resident as u32, |warp_id, lane_id| {
            let mut bucket = warp_id as usize;
            while bucket < buckets {
                let count = table.bucket_count(lane_id, bucket as u32);
                if lane_id == 0 {
                    elements.fetch_add(count as usize, Ordering::Relaxed);
                }
                bucket += resident;
            }
        });

        let elements = elements.into_inner();
        let total_slabs = self.num_buckets as usize + self.slab_alloc.allocated_slabs() as usize;
        let pair_bytes = core::mem::size_of::<K>() + core::mem::size_of::<V>();
        let slab_bytes = warp::WARP_WIDTH as usize * core::mem::size_of::<u32>();
        (elements * pair_bytes) as f64 / (total_slabs * slab_bytes) as f64
    }
}

#[cfg(not(target_arch = "nvptx64"))]
impl<K, V> SlabHash<K, V, XXHash32<K>>
where
    K: DeviceCopy + Copy + PartialEq + Default + Send + Sync,
    V: DeviceCopy + Copy + Default + Send + Sync,
{
    /// Builds a table hashed by [`XXHash32`] seeded from `options.seed`,
    /// for callers that do not supply their own functor.
    pub fn with_default_hasher(options: SlabHashOptions) -> Result<Self, Error> {
        let hasher = XXHash32::new(options.seed);
        Self::new(options, hasher)
    }
}

/// Simulated warps kept resident per launch; the batch is processed in
/// 32-key chunks grid-stride style, so any batch size works with a bounded
/// thread count while distinct warps still race for real.
#[cfg(not(target_arch = "nvptx64"))]
pub(crate) fn resident_warps(chunks: usize) -> usize {
    let parallelism = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4);
    chunks.min(parallelism.clamp(2, 8)).max(1)
}

/// Raw output pointer that may cross lane-thread boundaries; every lane
/// writes only its own batch index.
#[cfg(not(target_arch = "nvptx64"))]
#[derive(Copy, Clone)]
pub(crate) struct SendPtr<T>(pub(crate) *mut T);

// Safety: disjoint per-lane writes, see the uses above.
#[cfg(not(target_arch = "nvptx64"))]
unsafe impl<T> Send for SendPtr<T> {}
#[cfg(not(target_arch = "nvptx64"))]
unsafe impl<T> Sync for SendPtr<T> {}

// Device-side bulk kernels for the canonical u32/u32 table, one lane per
// key; a warp whose 32 keys are all past the batch end returns as a unit
// before touching the table.
#[cfg(target_arch = "nvptx64")]
mod kernels {
    use cuda_std::prelude::*;
    use cuda_std::thread;

    use crate::hash::XXHash32;
    use crate::slab_hash_ref::SlabHashRef;
    use crate::storage::AtomicWord;
    use crate::warp;

    use paste::paste;

    type K = u32;
    type V = u32;
    type Ref = SlabHashRef<K, V, XXHash32<K>>;

    macro_rules! slab_hash_device_kernels {
        ($suffix:ident) => {
            paste! {
                /// Bulk insert kernel.
                ///
                /// # Safety
                ///
                /// `keys` and `values` must be valid device pointers to at
                /// least `num_keys` elements, readable for the kernel's
                /// duration; `table` must refer to live pools.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<slab_hash_insert_ $suffix>](
                    table: Ref,
                    keys: *const K,
                    values: *const V,
                    num_keys: u32,
                ) {
                    let tid = thread::index_1d() as u32;
                    let lane_id = tid & (warp::WARP_WIDTH - 1);
                    if (tid - lane_id) >= num_keys {
                        return;
                    }

                    let mut table = table;
                    table.init_allocator(tid, lane_id);

                    let mut lane_active = false;
                    let mut bucket_id = 0;
                    let mut key = 0;
                    let mut value = 0;
                    if tid < num_keys {
                        lane_active = true;
                        // Safety: tid < num_keys and the caller guarantees
                        // both arrays cover num_keys elements.
                        key = unsafe { *keys.add(tid as usize) };
                        value = unsafe { *values.add(tid as usize) };
                        bucket_id = table.compute_bucket(&key);
                    }

                    table.insert(&mut lane_active, lane_id, bucket_id, &key, &value);
                }

                /// Bulk search kernel; writes `founds[i]` as a byte flag and
                /// the stored value (or `empty_value`) into `values[i]`.
                ///
                /// # Safety
                ///
                /// `keys`, `values`, and `founds` must be valid device
                /// pointers to at least `num_queries` elements; `values` and
                /// `founds` must be writable for the kernel's duration.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<slab_hash_search_ $suffix>](
                    table: Ref,
                    keys: *const K,
                    values: *mut V,
                    founds: *mut u8,
                    empty_value: V,
                    num_queries: u32,
                ) {
                    let tid = thread::index_1d() as u32;
                    let lane_id = tid & (warp::WARP_WIDTH - 1);
                    if (tid - lane_id) >= num_queries {
                        return;
                    }

                    let mut table = table;
                    table.init_allocator(tid, lane_id);

                    let mut lane_active = false;
                    let mut bucket_id = 0;
                    let mut key = 0;
                    if tid < num_queries {
                        lane_active = true;
                        // Safety: tid < num_queries, inside the key array.
                        key = unsafe { *keys.add(tid as usize) };
                        bucket_id = table.compute_bucket(&key);
                    }

                    let (pair, found) = table.search(&mut lane_active, lane_id, bucket_id, &key);

                    if tid < num_queries {
                        // Safety: tid < num_queries; each tid is written by
                        // exactly one lane.
                        unsafe {
                            *founds.add(tid as usize) = found as u8;
                            *values.add(tid as usize) = if found {
                                table.pair_alloc().extract(pair).second
                            } else {
                                empty_value
                            };
                        }
                    }
                }

                /// Bulk remove kernel.
                ///
                /// # Safety
                ///
                /// `keys` must be a valid device pointer to at least
                /// `num_keys` elements.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<slab_hash_remove_ $suffix>](
                    table: Ref,
                    keys: *const K,
                    num_keys: u32,
                ) {
                    let tid = thread::index_1d() as u32;
                    let lane_id = tid & (warp::WARP_WIDTH - 1);
                    if (tid - lane_id) >= num_keys {
                        return;
                    }

                    let mut table = table;
                    table.init_allocator(tid, lane_id);

                    let mut lane_active = false;
                    let mut bucket_id = 0;
                    let mut key = 0;
                    if tid < num_keys {
                        lane_active = true;
                        // Safety: tid < num_keys, inside the key array.
                        key = unsafe { *keys.add(tid as usize) };
                        bucket_id = table.compute_bucket(&key);
                    }

                    table.remove(&mut lane_active, lane_id, bucket_id, &key);
                }

                /// Per-bucket occupancy: one warp per bucket, summed on the
                /// host into the load-factor numerator.
                ///
                /// # Safety
                ///
                /// `counts` must be a valid device pointer to `num_buckets`
                /// writable elements.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<slab_hash_bucket_count_ $suffix>](
                    table: Ref,
                    counts: *mut u32,
                    num_buckets: u32,
                ) {
                    let tid = thread::index_1d() as u32;
                    let bucket_id = tid >> 5;
                    if bucket_id >= num_buckets {
                        return;
                    }
                    let lane_id = tid & (warp::WARP_WIDTH - 1);

                    let count = table.bucket_count(lane_id, bucket_id);
                    if lane_id == 0 {
                        // Safety: bucket_id < num_buckets; one writer per
                        // bucket.
                        unsafe { *counts.add(bucket_id as usize) = count };
                    }
                }

                /// Allocator fill: each thread popcounts one bitmap across
                /// all super blocks; the host converts free counts into
                /// allocated counts.
                ///
                /// # Safety
                ///
                /// `free_bits` must be a valid device pointer to one zeroed,
                /// writable element.
                #[kernel]
                #[allow(improper_ctypes_definitions)]
                pub unsafe fn [<slab_hash_bitmap_fill_ $suffix>](
                    table: Ref,
                    free_bits: *mut u32,
                ) {
                    let tid = thread::index_1d() as u32;
                    let alloc = table.slab_alloc();
                    if tid >= alloc.num_bitmaps() {
                        return;
                    }
                    let free = alloc.bitmap_free_bits(tid);
                    // Safety: the caller hands a valid accumulator word.
                    unsafe { AtomicWord::new(free_bits) }.fetch_add(free);
                }
            }
        };
    }

    slab_hash_device_kernels!(u32);
}
