//! Slab allocator: a fixed pool of 32-word slabs tracked by bitmap super
//! blocks, with warp-cooperative allocation and thread-wise free.
//!
//! Layout: the pool is divided into super blocks of 32 memory blocks; each
//! memory block carries one 32-bit bitmap covering 32 slabs (bit set = slab
//! free), so a super block spans 1024 slabs and its 32 bitmaps line up with
//! the 32 lanes of a scanning warp. Bitmaps and slab words are initialized
//! to the all-ones pattern; pool capacities below bitmap granularity are
//! handled by pre-clearing the tail bits at construction.

use core::marker::PhantomData;
use core::sync::atomic::Ordering;

use cust_core::DeviceCopy;

use crate::storage::AtomicWord;
#[cfg(not(target_arch = "nvptx64"))]
use crate::storage::Storage;
use crate::warp;

/// Sentinel for "no slab": returned by a failed allocation and terminating
/// every slab chain.
pub const EMPTY_SLAB: u32 = 0xffff_ffff;

/// Reserved index directing the walk to the bucket's head slab rather than
/// the allocator pool. Never returned by the allocator.
pub const HEAD_SLAB: u32 = 0xffff_fffe;

/// Memory blocks (= bitmaps) per super block; one per scanning lane.
pub const MEM_BLOCKS_PER_SUPER_BLOCK: u32 = 32;

/// Slabs covered by one bitmap.
pub const SLABS_PER_MEM_BLOCK: u32 = 32;

/// Slabs per super block.
pub const SLABS_PER_SUPER_BLOCK: u32 = MEM_BLOCKS_PER_SUPER_BLOCK * SLABS_PER_MEM_BLOCK;

/// Words per slab: one per lane.
pub const SLAB_WORDS: u32 = warp::WARP_WIDTH;

/// Slab word types. The index-addressed table stores 32-bit pair indices;
/// the packed table stores 64-bit inline key/value slots.
pub trait SlotWord: Copy + PartialEq + DeviceCopy + 'static {
    /// The all-ones pattern every fresh word carries.
    const FILLED: Self;
}

impl SlotWord for u32 {
    const FILLED: Self = u32::MAX;
}

impl SlotWord for u64 {
    const FILLED: Self = u64::MAX;
}

/// Device-side handle to the slab pool. Trivially copyable; each thread
/// keeps a private copy whose `resident_super_block` cursor is seeded by
/// [`init`](Self::init).
#[repr(C)]
pub struct SlabAllocRef<W> {
    num_super_blocks: u32,
    /// Per-thread scan cursor; uniform across a warp.
    resident_super_block: u32,
    bitmaps: *mut u32,
    slabs: *mut W,
    _phantom: PhantomData<W>,
}

impl<W> Clone for SlabAllocRef<W> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<W> Copy for SlabAllocRef<W> {}

// Safety: the struct is #[repr(C)] and holds only plain integers and raw
// pointers into device (or host-pool) memory; copying it shares the pool, it
// does not alias host-managed resources.
unsafe impl<W: DeviceCopy> DeviceCopy for SlabAllocRef<W> {}

// Safety: every access through the pointers is atomic word access; lane
// threads on the host may therefore share the handle freely.
unsafe impl<W> Send for SlabAllocRef<W> {}
unsafe impl<W> Sync for SlabAllocRef<W> {}

impl<W: SlotWord> SlabAllocRef<W> {
    /// # Safety
    ///
    /// `bitmaps` must cover `num_super_blocks * 32` words and `slabs` must
    /// cover `num_super_blocks * 1024 * 32` words, both initialized.
    pub const unsafe fn new(num_super_blocks: u32, bitmaps: *mut u32, slabs: *mut W) -> Self {
        Self {
            num_super_blocks,
            resident_super_block: 0,
            bitmaps,
            slabs,
            _phantom: PhantomData,
        }
    }

    /// Seeds this thread's scan cursor. Must run once per kernel entry per
    /// lane before any [`warp_allocate`](Self::warp_allocate); all lanes of
    /// a warp derive the same cursor so their scans stay converged, while
    /// distinct warps start on different super blocks.
    pub fn init(&mut self, tid: u32, lane_id: u32) {
        let warp_id = (tid - lane_id) >> 5;
        self.resident_super_block =
            warp_id.wrapping_mul(0x9e37_79b9) % self.num_super_blocks;
    }

    fn bitmap(&self, super_block: u32, block: u32) -> AtomicWord<'_, u32> {
        let index = (super_block * MEM_BLOCKS_PER_SUPER_BLOCK + block) as usize;
        // Safety: super_block < num_super_blocks and block < 32, so the
        // word is inside the bitmap array established by `new`.
        unsafe { AtomicWord::new(self.bitmaps.add(index)) }
    }

    /// Warp-cooperative allocation. All 32 lanes must call; every lane
    /// receives the same slab index. Returns [`EMPTY_SLAB`] once a full
    /// cyclic scan of the pool finds no free bit.
    ///
    /// Lane `i` reads bitmap `i` of the resident super block; the warp
    /// ballots over "my bitmap has a free bit", the lowest such lane clears
    /// the lowest free bit with a bitmap CAS, and the winning index is
    /// shuffled to the whole warp. A lost bitmap CAS re-reads and retries.
    pub fn warp_allocate(&mut self, lane_id: u32) -> u32 {
        let mut exhausted_blocks = 0;
        loop {
            let my_bitmap = self
                .bitmap(self.resident_super_block, lane_id)
                .load(Ordering::Acquire);
            let candidates = warp::ballot(my_bitmap != 0);

            if candidates == 0 {
                self.resident_super_block = (self.resident_super_block + 1) % self.num_super_blocks;
                exhausted_blocks += 1;
                if exhausted_blocks == self.num_super_blocks {
                    return EMPTY_SLAB;
                }
                continue;
            }

            let src_lane = candidates.trailing_zeros();
            let mut allocated = EMPTY_SLAB;
            if lane_id == src_lane {
                let bit = my_bitmap.trailing_zeros();
                let claimed = my_bitmap & !(1 << bit);
                let prev = self
                    .bitmap(self.resident_super_block, lane_id)
                    .compare_and_swap(my_bitmap, claimed);
                if prev == my_bitmap {
                    allocated = self.resident_super_block * SLABS_PER_SUPER_BLOCK
                        + lane_id * SLABS_PER_MEM_BLOCK
                        + bit;
                }
            }

            let slab = warp::shuffle(allocated, src_lane);
            if slab != EMPTY_SLAB {
                return slab;
            }
            // Lost the bitmap race to another warp; re-read and retry.
        }
    }

    /// Thread-wise release of a slab whose contents no other warp has
    /// observed (a lost publication race). Sets the bitmap bit back.
    pub fn free_untouched(&self, slab: u32) {
        let super_block = slab / SLABS_PER_SUPER_BLOCK;
        let block = (slab % SLABS_PER_SUPER_BLOCK) / SLABS_PER_MEM_BLOCK;
        let bit = slab % SLABS_PER_MEM_BLOCK;
        self.bitmap(super_block, block).fetch_or(1 << bit);
    }

    /// Maps a slab index plus a lane offset to the word that lane owns.
    pub fn word_ptr(&self, slab: u32, lane_id: u32) -> *mut W {
        // Safety: slab indices come from `warp_allocate` (or a published
        // next-slab pointer, which once held such an index) and lane_id is
        // < 32, so the word is inside the pool established by `new`.
        unsafe {
            self.slabs
                .add(slab as usize * SLAB_WORDS as usize + lane_id as usize)
        }
    }

    /// Total bitmaps in the pool; one per memory block.
    pub fn num_bitmaps(&self) -> u32 {
        self.num_super_blocks * MEM_BLOCKS_PER_SUPER_BLOCK
    }

    /// Popcount of set (free) bits in one bitmap; diagnostics input.
    pub fn bitmap_free_bits(&self, bitmap_index: u32) -> u32 {
        // Safety: bitmap_index < num_bitmaps(), inside the bitmap array.
        let word = unsafe { AtomicWord::new(self.bitmaps.add(bitmap_index as usize)) };
        word.load(Ordering::Acquire).count_ones()
    }
}

/// Host-owned slab pool.
#[cfg(not(target_arch = "nvptx64"))]
pub struct SlabAlloc<W> {
    capacity: u32,
    num_super_blocks: u32,
    bitmaps: Storage<u32>,
    slabs: Storage<W>,
}

#[cfg(not(target_arch = "nvptx64"))]
impl<W: SlotWord> SlabAlloc<W> {
    /// Builds a pool of `capacity` allocatable slabs, rounded up to super
    /// blocks internally; the excess tail bits are pre-marked used so the
    /// allocator never hands them out.
    pub fn new(capacity: u32) -> Self {
        let num_super_blocks = capacity.div_ceil(SLABS_PER_SUPER_BLOCK).max(1);
        let num_bitmaps = (num_super_blocks * MEM_BLOCKS_PER_SUPER_BLOCK) as usize;
        let mut bitmaps = Storage::new(num_bitmaps, u32::MAX);
        for (index, bitmap) in bitmaps.as_mut_slice().iter_mut().enumerate() {
            let first_slab = index as u32 * SLABS_PER_MEM_BLOCK;
            let usable = capacity.saturating_sub(first_slab).min(SLABS_PER_MEM_BLOCK);
            *bitmap = if usable == 32 { u32::MAX } else { (1u32 << usable) - 1 };
        }

        let slab_words = num_super_blocks as usize
            * SLABS_PER_SUPER_BLOCK as usize
            * SLAB_WORDS as usize;
        let slabs = Storage::new(slab_words, W::FILLED);

        Self {
            capacity,
            num_super_blocks,
            bitmaps,
            slabs,
        }
    }

    /// Allocatable slabs in the pool.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn alloc_ref(&self) -> SlabAllocRef<W> {
        // Safety: the storages cover exactly the extents `SlabAllocRef::new`
        // requires and stay alive (and address-stable) as long as `self`.
        unsafe {
            SlabAllocRef::new(
                self.num_super_blocks,
                self.bitmaps.ptr(),
                self.slabs.ptr(),
            )
        }
    }

    /// Slabs currently handed out: pool capacity minus the free-bit count
    /// across all bitmaps. This is the host half of the allocator-fill
    /// diagnostic; the per-bitmap popcounts come from
    /// [`SlabAllocRef::bitmap_free_bits`].
    pub fn allocated_slabs(&self) -> u32 {
        let handle = self.alloc_ref();
        let free: u32 = (0..handle.num_bitmaps())
            .map(|index| handle.bitmap_free_bits(index))
            .sum();
        self.capacity - free
    }
}

#[cfg(all(test, not(target_arch = "nvptx64")))]
mod tests {
    use super::*;
    use crate::warp;
    use std::sync::Mutex;

    #[test]
    fn warp_allocation_is_uniform_and_distinct() {
        let pool = SlabAlloc::<u32>::new(64);
        let seen = Mutex::new(Vec::new());
        warp::launch(1, |_, lane| {
            let mut handle = pool.alloc_ref();
            handle.init(lane, lane);
            let first = handle.warp_allocate(lane);
            let second = handle.warp_allocate(lane);
            assert_ne!(first, EMPTY_SLAB);
            assert_ne!(second, EMPTY_SLAB);
            assert_ne!(first, second);
            if lane == 0 {
                seen.lock().unwrap().extend([first, second]);
            }
        });
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(pool.allocated_slabs(), 2);
    }

    #[test]
    fn pool_exhausts_at_capacity() {
        let pool = SlabAlloc::<u32>::new(3);
        warp::launch(1, |_, lane| {
            let mut handle = pool.alloc_ref();
            handle.init(lane, lane);
            for _ in 0..3 {
                assert_ne!(handle.warp_allocate(lane), EMPTY_SLAB);
            }
            assert_eq!(handle.warp_allocate(lane), EMPTY_SLAB);
        });
        assert_eq!(pool.allocated_slabs(), 3);
    }

    #[test]
    fn free_untouched_returns_slab_to_pool() {
        let pool = SlabAlloc::<u32>::new(2);
        warp::launch(1, |_, lane| {
            let mut handle = pool.alloc_ref();
            handle.init(lane, lane);
            let slab = handle.warp_allocate(lane);
            if lane == 0 {
                handle.free_untouched(slab);
            }
            // Rendezvous so the free lands before the next allocation scan.
            warp::ballot(true);
            let again = handle.warp_allocate(lane);
            assert_eq!(again, slab);
        });
        assert_eq!(pool.allocated_slabs(), 1);
    }

    #[test]
    fn fresh_slab_words_carry_the_empty_pattern() {
        let pool = SlabAlloc::<u64>::new(1);
        warp::launch(1, |_, lane| {
            let mut handle = pool.alloc_ref();
            handle.init(lane, lane);
            let slab = handle.warp_allocate(lane);
            let word = unsafe { *handle.word_ptr(slab, lane) };
            assert_eq!(word, u64::MAX);
        });
    }
}
