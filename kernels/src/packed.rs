//! Packed slab hash variant: key and value stored inline in one 64-bit
//! slot, published together by a single 64-bit CAS.
//!
//! For 32-bit POD keys and values the pair-pool indirection can be dropped
//! entirely: a slot word is either the all-ones empty pattern or
//! `key << 32 | value`. The warp protocol is the index-addressed one over
//! 64-bit words — same work-queue skeleton, same branches — minus the
//! pre-loop record allocation, since there is nothing to allocate. No
//! partial (key set, value pending) state is ever observable. The all-ones
//! key is reserved for the empty pattern.

use core::sync::atomic::Ordering;

use cust_core::DeviceCopy;

#[cfg(not(target_arch = "nvptx64"))]
use std::sync::atomic::AtomicUsize;

#[cfg(not(target_arch = "nvptx64"))]
use log::debug;

#[cfg(not(target_arch = "nvptx64"))]
use crate::error::Error;
use crate::hash::BucketHash;
#[cfg(not(target_arch = "nvptx64"))]
use crate::hash::XXHash32;
#[cfg(not(target_arch = "nvptx64"))]
use crate::slab_alloc::SlabAlloc;
use crate::slab_alloc::{SlabAllocRef, EMPTY_SLAB, HEAD_SLAB};
#[cfg(not(target_arch = "nvptx64"))]
use crate::slab_hash::SlabHashOptions;
use crate::slab_hash_ref::LaneLayoutCheck;
use crate::storage::AtomicWord;
#[cfg(not(target_arch = "nvptx64"))]
use crate::storage::Storage;
use crate::warp;

/// The all-ones empty slot pattern. A live slot never carries it because
/// the all-ones key is reserved.
pub const EMPTY_PAIR_PACKED: u64 = u64::MAX;

/// 32-bit POD keys and values the packed variant can inline.
pub trait SlotBits: Copy + PartialEq {
    fn to_bits(self) -> u32;
    fn from_bits(bits: u32) -> Self;
}

impl SlotBits for u32 {
    fn to_bits(self) -> u32 {
        self
    }
    fn from_bits(bits: u32) -> Self {
        bits
    }
}

impl SlotBits for i32 {
    fn to_bits(self) -> u32 {
        self as u32
    }
    fn from_bits(bits: u32) -> Self {
        bits as i32
    }
}

#[inline(always)]
fn pack<K: SlotBits, V: SlotBits>(key: &K, value: &V) -> u64 {
    ((key.to_bits() as u64) << 32) | value.to_bits() as u64
}

#[inline(always)]
fn slot_key_bits(word: u64) -> u32 {
    (word >> 32) as u32
}

/// Trivially copyable handle to a packed table; the same per-lane usage
/// contract as [`SlabHashRef`](crate::slab_hash_ref::SlabHashRef).
#[repr(C)]
pub struct PackedSlabHashRef<K, V, H> {
    num_buckets: u32,
    hasher: H,
    bucket_heads: *mut u64,
    slab_alloc: SlabAllocRef<u64>,
    _phantom: core::marker::PhantomData<(K, V)>,
}

impl<K, V, H: Copy> Clone for PackedSlabHashRef<K, V, H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V, H: Copy> Copy for PackedSlabHashRef<K, V, H> {}

// Safety: #[repr(C)] with integer, functor, raw-pointer, and DeviceCopy
// handle fields only.
unsafe impl<K: DeviceCopy, V: DeviceCopy, H: DeviceCopy> DeviceCopy
    for PackedSlabHashRef<K, V, H>
{
}

// Safety: all shared state behind the pointers is mutated through 64-bit
// atomic word access.
unsafe impl<K, V, H> Send for PackedSlabHashRef<K, V, H> {}
unsafe impl<K, V, H> Sync for PackedSlabHashRef<K, V, H> {}

impl<K, V, H> PackedSlabHashRef<K, V, H>
where
    K: SlotBits,
    V: SlotBits,
    H: BucketHash<K>,
{
    /// # Safety
    ///
    /// `bucket_heads` must cover `num_buckets * 32` words initialized to the
    /// all-ones pattern, and the allocator handle must refer to a live
    /// 64-bit-word pool.
    pub unsafe fn new(
        num_buckets: u32,
        hasher: H,
        bucket_heads: *mut u64,
        slab_alloc: SlabAllocRef<u64>,
    ) -> Self {
        let _ = LaneLayoutCheck::<K>::CHECK;
        let _ = LaneLayoutCheck::<V>::CHECK;
        Self {
            num_buckets,
            hasher,
            bucket_heads,
            slab_alloc,
            _phantom: core::marker::PhantomData,
        }
    }

    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    pub fn compute_bucket(&self, key: &K) -> u32 {
        self.hasher.hash(key) % self.num_buckets
    }

    pub fn slab_alloc(&self) -> &SlabAllocRef<u64> {
        &self.slab_alloc
    }

    /// Seeds this lane's allocator cursor; once per kernel entry.
    pub fn init_allocator(&mut self, tid: u32, lane_id: u32) {
        self.slab_alloc.init(tid, lane_id);
    }

    fn slot_word(&self, curr_slab: u32, bucket_id: u32, lane: u32) -> AtomicWord<'_, u64> {
        let ptr = if curr_slab == HEAD_SLAB {
            // Safety: bucket_id < num_buckets and lane < 32, inside the head
            // array established by `new`.
            unsafe {
                self.bucket_heads
                    .add(bucket_id as usize * warp::WARP_WIDTH as usize + lane as usize)
            }
        } else {
            self.slab_alloc.word_ptr(curr_slab, lane)
        };
        // Safety: both arms yield in-bounds, 8-byte aligned, initialized
        // words.
        unsafe { AtomicWord::new(ptr) }
    }

    fn warp_find_key(&self, src_key_bits: u32, lane_id: u32, unit_data: u64) -> i32 {
        let is_lane_found = (1u32 << lane_id) & warp::PAIR_SLOT_LANES_MASK != 0
            && unit_data != EMPTY_PAIR_PACKED
            && slot_key_bits(unit_data) == src_key_bits;
        warp::find_first_set(warp::ballot(is_lane_found) & warp::PAIR_SLOT_LANES_MASK)
    }

    fn warp_find_empty(&self, unit_data: u64) -> i32 {
        let is_lane_empty = unit_data == EMPTY_PAIR_PACKED;
        warp::find_first_set(warp::ballot(is_lane_empty) & warp::PAIR_SLOT_LANES_MASK)
    }

    /// Next-slab pointer broadcast: lane 31's word is either all-ones or a
    /// published slab index.
    fn broadcast_next_slab(unit_data: u64) -> u32 {
        let next = warp::shuffle_wide(unit_data, warp::NEXT_SLAB_LANE);
        if next == EMPTY_PAIR_PACKED {
            EMPTY_SLAB
        } else {
            next as u32
        }
    }

    /// Warp-cooperative search; `(value, true)` when found.
    pub fn search(
        &self,
        lane_active: &mut bool,
        lane_id: u32,
        bucket_id: u32,
        key: &K,
    ) -> (V, bool) {
        let mut prev_work_queue = 0u32;
        let mut curr_slab = HEAD_SLAB;
        let mut result = (V::from_bits(0), false);

        loop {
            let work_queue = warp::ballot(*lane_active);
            if work_queue == 0 {
                break;
            }
            if work_queue != prev_work_queue {
                curr_slab = HEAD_SLAB;
            }
            let src_lane = work_queue.trailing_zeros();
            let src_bucket = warp::shuffle(bucket_id, src_lane);
            let src_key_bits = warp::shuffle(key.to_bits(), src_lane);

            let unit_data = self
                .slot_word(curr_slab, src_bucket, lane_id)
                .load(Ordering::Acquire);

            let lane_found = self.warp_find_key(src_key_bits, lane_id, unit_data);

            if lane_found >= 0 {
                let found_word = warp::shuffle_wide(unit_data, lane_found as u32);
                if lane_id == src_lane {
                    *lane_active = false;
                    result = (V::from_bits(found_word as u32), true);
                }
            } else {
                let next_slab = Self::broadcast_next_slab(unit_data);
                if next_slab == EMPTY_SLAB {
                    if lane_id == src_lane {
                        *lane_active = false;
                    }
                } else {
                    curr_slab = next_slab;
                }
            }

            prev_work_queue = work_queue;
        }

        result
    }

    /// Warp-cooperative insert-if-absent; key and value go out in one
    /// 64-bit publication CAS, so there is nothing to pre-allocate and
    /// nothing to free on the abort branches.
    pub fn insert(
        &mut self,
        lane_active: &mut bool,
        lane_id: u32,
        bucket_id: u32,
        key: &K,
        value: &V,
    ) -> bool {
        let mut prev_work_queue = 0u32;
        let mut curr_slab = HEAD_SLAB;
        let mut inserted = false;
        let my_packed = pack(key, value);

        loop {
            let work_queue = warp::ballot(*lane_active);
            if work_queue == 0 {
                break;
            }
            if work_queue != prev_work_queue {
                curr_slab = HEAD_SLAB;
            }
            let src_lane = work_queue.trailing_zeros();
            let src_bucket = warp::shuffle(bucket_id, src_lane);
            let src_key_bits = warp::shuffle(key.to_bits(), src_lane);

            let unit_data = self
                .slot_word(curr_slab, src_bucket, lane_id)
                .load(Ordering::Acquire);

            let lane_found = self.warp_find_key(src_key_bits, lane_id, unit_data);
            let lane_empty = self.warp_find_empty(unit_data);

            if lane_found >= 0 {
                // Duplicate: the table keeps the original entry.
                if lane_id == src_lane {
                    *lane_active = false;
                }
            } else if lane_empty >= 0 {
                if lane_id == src_lane {
                    let slot = self.slot_word(curr_slab, src_bucket, lane_empty as u32);
                    let prev = slot.compare_and_swap(EMPTY_PAIR_PACKED, my_packed);
                    if prev == EMPTY_PAIR_PACKED {
                        *lane_active = false;
                        inserted = true;
                    }
                    // Lost the slot: re-read next iteration.
                }
            } else {
                let next_slab = Self::broadcast_next_slab(unit_data);
                if next_slab != EMPTY_SLAB {
                    curr_slab = next_slab;
                } else {
                    let new_slab = self.slab_alloc.warp_allocate(lane_id);
                    if new_slab == EMPTY_SLAB {
                        if lane_id == src_lane {
                            *lane_active = false;
                        }
                    } else if lane_id == warp::NEXT_SLAB_LANE {
                        let slot = self.slot_word(curr_slab, src_bucket, warp::NEXT_SLAB_LANE);
                        let prev = slot.compare_and_swap(EMPTY_PAIR_PACKED, new_slab as u64);
                        if prev != EMPTY_PAIR_PACKED {
                            self.slab_alloc.free_untouched(new_slab);
                        }
                    }
                }
            }

            prev_work_queue = work_queue;
        }

        inserted
    }

    /// Warp-cooperative remove; the CAS expects the observed slot word.
    pub fn remove(&self, lane_active: &mut bool, lane_id: u32, bucket_id: u32, key: &K) -> bool {
        let mut prev_work_queue = 0u32;
        let mut curr_slab = HEAD_SLAB;
        let mut removed = false;

        loop {
            let work_queue = warp::ballot(*lane_active);
            if work_queue == 0 {
                break;
            }
            if work_queue != prev_work_queue {
                curr_slab = HEAD_SLAB;
            }
            let src_lane = work_queue.trailing_zeros();
            let src_bucket = warp::shuffle(bucket_id, src_lane);
            let src_key_bits = warp::shuffle(key.to_bits(), src_lane);

            let unit_data = self
                .slot_word(curr_slab, src_bucket, lane_id)
                .load(Ordering::Acquire);

            let lane_found = self.warp_find_key(src_key_bits, lane_id, unit_data);

            if lane_found >= 0 {
                let observed = warp::shuffle_wide(unit_data, lane_found as u32);
                if lane_id == src_lane {
                    let slot = self.slot_word(curr_slab, src_bucket, lane_found as u32);
                    if slot.compare_and_swap(observed, EMPTY_PAIR_PACKED) == observed {
                        removed = true;
                    }
                    *lane_active = false;
                }
            } else {
                let next_slab = Self::broadcast_next_slab(unit_data);
                if next_slab == EMPTY_SLAB {
                    if lane_id == src_lane {
                        *lane_active = false;
                    }
                } else {
                    curr_slab = next_slab;
                }
            }

            prev_work_queue = work_queue;
        }

        removed
    }

    /// Warp-cooperative occupancy count of one bucket's chain.
    pub fn bucket_count(&self, lane_id: u32, bucket_id: u32) -> u32 {
        let mut count = 0u32;

        let mut unit_data = self
            .slot_word(HEAD_SLAB, bucket_id, lane_id)
            .load(Ordering::Acquire);
        count += (warp::ballot(unit_data != EMPTY_PAIR_PACKED) & warp::PAIR_SLOT_LANES_MASK)
            .count_ones();
        let mut next = Self::broadcast_next_slab(unit_data);

        while next != EMPTY_SLAB {
            unit_data = self
                .slot_word(next, bucket_id, lane_id)
                .load(Ordering::Acquire);
            count += (warp::ballot(unit_data != EMPTY_PAIR_PACKED) & warp::PAIR_SLOT_LANES_MASK)
                .count_ones();
            next = Self::broadcast_next_slab(unit_data);
        }

        count
    }
}

/// Host-facing packed table. Same bulk surface as
/// [`SlabHash`](crate::slab_hash::SlabHash); capacity is bounded by slab
/// space alone, so only slab exhaustion can drop keys.
#[cfg(not(target_arch = "nvptx64"))]
pub struct PackedSlabHash<K, V, H> {
    num_buckets: u32,
    device_index: u32,
    hasher: H,
    bucket_heads: Storage<u64>,
    slab_alloc: SlabAlloc<u64>,
    _phantom: core::marker::PhantomData<(K, V)>,
}

#[cfg(not(target_arch = "nvptx64"))]
impl<K, V, H> PackedSlabHash<K, V, H>
where
    K: SlotBits + Default + Send + Sync,
    V: SlotBits + Default + Send + Sync,
    H: BucketHash<K>,
{
    pub fn new(options: SlabHashOptions, hasher: H) -> Result<Self, Error> {
        let slab_count = options.validate()?;
        debug!(
            "packed slab hash: {} buckets, {} chain slabs, device {}",
            options.num_buckets, slab_count, options.device_index
        );

        let head_words = options.num_buckets as usize * warp::WARP_WIDTH as usize;
        Ok(Self {
            num_buckets: options.num_buckets,
            device_index: options.device_index,
            hasher,
            bucket_heads: Storage::new(head_words, u64::MAX),
            slab_alloc: SlabAlloc::new(slab_count),
            _phantom: core::marker::PhantomData,
        })
    }

    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    pub fn device_index(&self) -> u32 {
        self.device_index
    }

    pub fn device_ref(&self) -> PackedSlabHashRef<K, V, H> {
        // Safety: the owned storages match the extents
        // `PackedSlabHashRef::new` requires, are all-ones initialized, and
        // live as long as `self`.
        unsafe {
            PackedSlabHashRef::new(
                self.num_buckets,
                self.hasher,
                self.bucket_heads.ptr(),
                self.slab_alloc.alloc_ref(),
            )
        }
    }

    /// Bulk insert-if-absent; returns the number of keys newly inserted.
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
        let resident = crate::slab_hash::resident_warps(chunks);
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
                if table.insert(&mut lane_active, lane_id, bucket_id, &key, &value) {
                    inserted.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
                }
                chunk += resident;
            }
        });

        let inserted = inserted.into_inner();
        debug!("packed bulk insert: {} of {} keys newly inserted", inserted, n);
        Ok(inserted)
    }

    /// Bulk search; byte flags plus values (default when absent).
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
        let resident = crate::slab_hash::resident_warps(chunks);
        let values_out = crate::slab_hash::SendPtr(values.as_mut_ptr());
        let founds_out = crate::slab_hash::SendPtr(founds.as_mut_ptr());
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
                let (value, found) = table.search(&mut lane_active, lane_id, bucket_id, &key);
                if tid < n {
                    // Safety: each tid is written by exactly one lane, and
                    // the output slices outlive the launch scope.
                    unsafe {
                        *values_out.0.add(tid) = if found { value } else { V::default() };
                        *founds_out.0.add(tid) = found as u8;
                    }
                }
                chunk += resident;
            }
        });

        Ok(())
    }

    /// Bulk remove-if-present; returns the number of keys removed.
    pub fn remove(&mut self, keys: &[K]) -> Result<usize, Error> {
        if keys.is_empty() {
            return Ok(0);
        }

        let n = keys.len();
        let chunks = n.div_ceil(warp::WARP_WIDTH as usize);
        let resident = crate::slab_hash::resident_warps(chunks);
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
                    removed.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
                }
                chunk += resident;
            }
        });

        Ok(removed.into_inner())
    }

    /// Live pair bytes divided by allocated slab bytes (64-bit words here).
    pub fn compute_load_factor(&self) -> f64 {
        let buckets = self.num_buckets as usize;
        let resident = crate::slab_hash::resident_warps(buckets);
        let elements = AtomicUsize::new(0);
        let table = self.device_ref();

        warp::launch(resident as u32, |warp_id, lane_id| {
            let mut bucket = warp_id as usize;
            while bucket < buckets {
                let count = table.bucket_count(lane_id, bucket as u32);
                if lane_id == 0 {
                    elements.fetch_add(count as usize, core::sync::atomic::Ordering::Relaxed);
                }
                bucket += resident;
            }
        });

        let elements = elements.into_inner();
        let total_slabs = self.num_buckets as usize + self.slab_alloc.allocated_slabs() as usize;
        let pair_bytes = core::mem::size_of::<K>() + core::mem::size_of::<V>();
        let slab_bytes = warp::WARP_WIDTH as usize * core::mem::size_of::<u64>();
        (elements * pair_bytes) as f64 / (total_slabs * slab_bytes) as f64
    }
}

#[cfg(not(target_arch = "nvptx64"))]
impl<K, V> PackedSlabHash<K, V, XXHash32<K>>
where
    K: SlotBits + Default + Send + Sync,
    V: SlotBits + Default + Send + Sync,
{
    /// Builds a packed table hashed by [`XXHash32`] seeded from
    /// `options.seed`.
    pub fn with_default_hasher(options: SlabHashOptions) -> Result<Self, Error> {
        let hasher = XXHash32::new(options.seed);
        Self::new(options, hasher)
    }
}
