//! Device-side slab hash handle: the warp-cooperative work-sharing loop and
//! the per-operation state machines.
//!
//! Every operation shares one skeleton. Each lane carries an `active` flag;
//! per iteration the warp ballots the active lanes, services the lowest one
//! (broadcasting its bucket and key), and all 32 lanes read one word of the
//! current slab: lanes 0..=30 a pair slot each, lane 31 the next-slab
//! pointer. Exactly one lane retires per iteration; everyone else
//! contributes its word read. Mutations land via single-word CAS only, so
//! the table never holds a lock and no transaction spans more than one word.

use core::marker::PhantomData;
use core::sync::atomic::Ordering;

use cust_core::DeviceCopy;

use crate::hash::BucketHash;
use crate::pair::Pair;
use crate::pair_alloc::{PairAllocRef, EMPTY_PAIR};
use crate::slab_alloc::{SlabAllocRef, EMPTY_SLAB, HEAD_SLAB};
use crate::storage::AtomicWord;
use crate::warp;

/// Monomorphization-time layout guard: lane-granular key broadcasts move
/// 32-bit chunks, so keys and values must be a non-zero multiple of 4 bytes.
pub(crate) struct LaneLayoutCheck<T>(PhantomData<T>);

impl<T> LaneLayoutCheck<T> {
    pub(crate) const CHECK: () = assert!(
        core::mem::size_of::<T>() % 4 == 0 && core::mem::size_of::<T>() != 0,
        "slab hash keys and values must be a non-zero multiple of 32 bits"
    );
}

/// Trivially copyable handle passed by value to every lane. The embedded
/// allocator handle carries per-thread cursor state, so each lane keeps a
/// private copy and seeds it with [`init_allocator`](Self::init_allocator)
/// once per kernel entry.
#[repr(C)]
pub struct SlabHashRef<K, V, H> {
    num_buckets: u32,
    hasher: H,
    bucket_heads: *mut u32,
    slab_alloc: SlabAllocRef<u32>,
    pair_alloc: PairAllocRef<K, V>,
}

impl<K, V, H: Copy> Clone for SlabHashRef<K, V, H> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V, H: Copy> Copy for SlabHashRef<K, V, H> {}

// Safety: #[repr(C)] with integer, functor, raw-pointer, and DeviceCopy
// handle fields only; no references to host-managed resources.
unsafe impl<K: DeviceCopy, V: DeviceCopy, H: DeviceCopy> DeviceCopy for SlabHashRef<K, V, H> {}

// Safety: all shared state behind the pointers is mutated through atomic
// word access or the allocators' publication protocols.
unsafe impl<K, V, H> Send for SlabHashRef<K, V, H> {}
unsafe impl<K, V, H> Sync for SlabHashRef<K, V, H> {}

impl<K, V, H> SlabHashRef<K, V, H>
where
    K: DeviceCopy + Copy + PartialEq,
    V: DeviceCopy + Copy,
    H: BucketHash<K>,
{
    /// # Safety
    ///
    /// `bucket_heads` must cover `num_buckets * 32` words initialized to the
    /// all-ones pattern, and both allocator handles must refer to live,
    /// initialized pools.
    pub unsafe fn new(
        num_buckets: u32,
        hasher: H,
        bucket_heads: *mut u32,
        slab_alloc: SlabAllocRef<u32>,
        pair_alloc: PairAllocRef<K, V>,
    ) -> Self {
        let _ = LaneLayoutCheck::<K>::CHECK;
        let _ = LaneLayoutCheck::<V>::CHECK;
        Self {
            num_buckets,
            hasher,
            bucket_heads,
            slab_alloc,
            pair_alloc,
        }
    }

    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    pub fn compute_bucket(&self, key: &K) -> u32 {
        self.hasher.hash(key) % self.num_buckets
    }

    pub fn pair_alloc(&self) -> &PairAllocRef<K, V> {
        &self.pair_alloc
    }

    pub fn slab_alloc(&self) -> &SlabAllocRef<u32> {
        &self.slab_alloc
    }

    /// Seeds this lane's allocator cursor; once per kernel entry, before the
    /// first operation.
    pub fn init_allocator(&mut self, tid: u32, lane_id: u32) {
        self.slab_alloc.init(tid, lane_id);
    }

    /// Atomic view of one slot word of the current slab (or of the bucket's
    /// head slab when `curr_slab` is [`HEAD_SLAB`]).
    fn slot_word(&self, curr_slab: u32, bucket_id: u32, lane: u32) -> AtomicWord<'_, u32> {
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
        // Safety: both arms yield in-bounds, 4-byte aligned, initialized
        // words.
        unsafe { AtomicWord::new(ptr) }
    }

    /// Ballot over "my slot holds the serviced key"; lane 31 is masked out
    /// of the key test. Returns the lowest matching lane or -1.
    fn warp_find_key(&self, src_key: &K, lane_id: u32, unit_data: u32) -> i32 {
        let is_lane_found = (1u32 << lane_id) & warp::PAIR_SLOT_LANES_MASK != 0
            && unit_data != EMPTY_PAIR
            // Safety: a non-empty slot word observed in the walk is a
            // published live handle.
            && unsafe { self.pair_alloc.extract(unit_data) }.first == *src_key;
        warp::find_first_set(warp::ballot(is_lane_found) & warp::PAIR_SLOT_LANES_MASK)
    }

    /// Ballot over "my pair slot is empty". Returns the lowest empty lane or
    /// -1, which makes slot filling first-fit within each slab.
    fn warp_find_empty(&self, unit_data: u32) -> i32 {
        let is_lane_empty = unit_data == EMPTY_PAIR;
        warp::find_first_set(warp::ballot(is_lane_empty) & warp::PAIR_SLOT_LANES_MASK)
    }

    /// Warp-cooperative search. Returns `(pair_index, true)` for the lane's
    /// own query when found, `(EMPTY_PAIR, false)` otherwise. Lanes entering
    /// with `lane_active == false` only contribute slab reads.
    pub fn search(
        &self,
        lane_active: &mut bool,
        lane_id: u32,
        bucket_id: u32,
        key: &K,
    ) -> (u32, bool) {
        let mut prev_work_queue = 0u32;
        let mut curr_slab = HEAD_SLAB;
        let mut result = (EMPTY_PAIR, false);

        loop {
            let work_queue = warp::ballot(*lane_active);
            if work_queue == 0 {
                break;
            }
            // Restart from the chain head when the serviced lane changed.
            if work_queue != prev_work_queue {
                curr_slab = HEAD_SLAB;
            }
            let src_lane = work_queue.trailing_zeros();
            let src_bucket = warp::shuffle(bucket_id, src_lane);
            let src_key = warp::shuffle_key(key, src_lane);

            let unit_data = self
                .slot_word(curr_slab, src_bucket, lane_id)
                .load(Ordering::Acquire);

            let lane_found = self.warp_find_key(&src_key, lane_id, unit_data);

            if lane_found >= 0 {
                // Found in this slab; broadcast the handle to the serviced
                // lane.
                let found_pair = warp::shuffle(unit_data, lane_found as u32);
                if lane_id == src_lane {
                    *lane_active = false;
                    result = (found_pair, true);
                }
            } else {
                let next_slab = warp::shuffle(unit_data, warp::NEXT_SLAB_LANE);
                if next_slab == EMPTY_SLAB {
                    // Chain exhausted; the key is absent.
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

    /// Warp-cooperative insert: insert-if-absent, never overwriting. Returns
    /// `(pair_index, true)` for a newly published record, `(EMPTY_PAIR,
    /// false)` for duplicates and exhausted pools.
    ///
    /// Every active lane allocates and fills its record *before* the loop;
    /// allocating inside would diverge lanes ahead of the warp-wide ballots
    /// below. Records that lose (duplicate key, no slab left) go back to the
    /// pool.
    pub fn insert(
        &mut self,
        lane_active: &mut bool,
        lane_id: u32,
        bucket_id: u32,
        key: &K,
        value: &V,
    ) -> (u32, bool) {
        let mut prev_work_queue = 0u32;
        let mut curr_slab = HEAD_SLAB;
        let mut result = (EMPTY_PAIR, false);

        let mut prealloc_pair = EMPTY_PAIR;
        if *lane_active {
            prealloc_pair = self.pair_alloc.allocate();
            if prealloc_pair == EMPTY_PAIR {
                // Pool exhausted: this lane reports not-inserted; the rest
                // of the warp is unaffected.
                *lane_active = false;
            } else {
                // Safety: freshly allocated on this lane, not yet published.
                unsafe { self.pair_alloc.write(prealloc_pair, Pair::new(*key, *value)) };
            }
        }

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
            let src_key = warp::shuffle_key(key, src_lane);

            let unit_data = self
                .slot_word(curr_slab, src_bucket, lane_id)
                .load(Ordering::Acquire);

            let lane_found = self.warp_find_key(&src_key, lane_id, unit_data);
            let lane_empty = self.warp_find_empty(unit_data);

            if lane_found >= 0 {
                // Branch 1: the key already exists; abort and keep the
                // original entry.
                if lane_id == src_lane {
                    *lane_active = false;
                    self.pair_alloc.free(prealloc_pair);
                }
            } else if lane_empty >= 0 {
                // Branch 2: an empty slot is available; try to publish.
                if lane_id == src_lane {
                    let slot = self.slot_word(curr_slab, src_bucket, lane_empty as u32);
                    let prev = slot.compare_and_swap(EMPTY_PAIR, prealloc_pair);
                    if prev == EMPTY_PAIR {
                        *lane_active = false;
                        result = (prealloc_pair, true);
                    }
                    // Lost the slot: re-read next iteration. If the racing
                    // writer published this very key we land in Branch 1;
                    // otherwise Branch 2 or 3 again.
                }
            } else {
                // Branch 3: slab full of other keys; follow or grow the
                // chain.
                let next_slab = warp::shuffle(unit_data, warp::NEXT_SLAB_LANE);
                if next_slab != EMPTY_SLAB {
                    curr_slab = next_slab;
                } else {
                    let new_slab = self.slab_alloc.warp_allocate(lane_id);
                    if new_slab == EMPTY_SLAB {
                        // No slab left anywhere: this key reports
                        // not-inserted and returns its record.
                        if lane_id == src_lane {
                            *lane_active = false;
                            self.pair_alloc.free(prealloc_pair);
                        }
                    } else if lane_id == warp::NEXT_SLAB_LANE {
                        let slot = self.slot_word(curr_slab, src_bucket, warp::NEXT_SLAB_LANE);
                        let prev = slot.compare_and_swap(EMPTY_SLAB, new_slab);
                        if prev != EMPTY_SLAB {
                            // A competing warp published first; the fresh
                            // slab was never observed, so it goes straight
                            // back.
                            self.slab_alloc.free_untouched(new_slab);
                        }
                        // Either way the next iteration walks into whichever
                        // slab won and lands in Branch 2.
                    }
                }
            }

            prev_work_queue = work_queue;
        }

        result
    }

    /// Warp-cooperative remove. Returns true when this lane's key was found
    /// and this call cleared its slot; removing an absent key is a no-op.
    ///
    /// The CAS expects the pair index the warp observed, so a slot that was
    /// concurrently emptied (or re-filled) fails the CAS and the record is
    /// not freed here. The lane retires either way: a second pass could see
    /// the key re-inserted into a different slot.
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
            let src_key = warp::shuffle_key(key, src_lane);

            let unit_data = self
                .slot_word(curr_slab, src_bucket, lane_id)
                .load(Ordering::Acquire);

            let lane_found = self.warp_find_key(&src_key, lane_id, unit_data);

            if lane_found >= 0 {
                let observed_pair = warp::shuffle(unit_data, lane_found as u32);
                if lane_id == src_lane {
                    let slot = self.slot_word(curr_slab, src_bucket, lane_found as u32);
                    let prev = slot.compare_and_swap(observed_pair, EMPTY_PAIR);
                    if prev == observed_pair {
                        // This call cleared the unique reference; the record
                        // can go back to the pool.
                        self.pair_alloc.free(observed_pair);
                        removed = true;
                    }
                    // Lost: another warp removed this exact reference.
                    *lane_active = false;
                }
            } else {
                let next_slab = warp::shuffle(unit_data, warp::NEXT_SLAB_LANE);
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

    /// Warp-cooperative occupancy count of one bucket's chain: every lane
    /// reads its word per slab, the warp popcounts the non-empty pair slots
    /// and follows lane 31's pointer. Chains are never shortened, so the
    /// walk terminates at the first empty next-pointer.
    pub fn bucket_count(&self, lane_id: u32, bucket_id: u32) -> u32 {
        let mut count = 0u32;

        let mut unit_data = self
            .slot_word(HEAD_SLAB, bucket_id, lane_id)
            .load(Ordering::Acquire);
        count += (warp::ballot(unit_data != EMPTY_PAIR) & warp::PAIR_SLOT_LANES_MASK).count_ones();
        let mut next = warp::shuffle(unit_data, warp::NEXT_SLAB_LANE);

        while next != EMPTY_SLAB {
            unit_data = self
                .slot_word(next, bucket_id, lane_id)
                .load(Ordering::Acquire);
            count +=
                (warp::ballot(unit_data != EMPTY_PAIR) & warp::PAIR_SLOT_LANES_MASK).count_ones();
            next = warp::shuffle(unit_data, warp::NEXT_SLAB_LANE);
        }

        count
    }
}
