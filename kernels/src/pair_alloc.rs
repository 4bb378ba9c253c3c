//! Pair allocator: an index-addressed pool of key/value records with an
//! index-stack free list.
//!
//! Allocation and free are thread-wise (no warp coordination): a shared
//! cursor partitions the `heap` index array into a handed-out prefix and a
//! free suffix. `allocate` bumps the cursor and takes the index it uncovers;
//! `free` retreats the cursor and stores the released index there. Index
//! handles fit in one 32-bit slot word, which is what keeps the table's
//! publication CAS a single-word operation.

use core::marker::PhantomData;
use core::sync::atomic::Ordering;

use cust_core::DeviceCopy;

use crate::pair::Pair;
use crate::storage::AtomicWord;
#[cfg(not(target_arch = "nvptx64"))]
use crate::storage::Storage;

/// Sentinel for "no record". Never issued as a handle; marks empty pair
/// slots in every slab.
pub const EMPTY_PAIR: u32 = 0xffff_ffff;

/// Device-side handle to the pair pool.
#[repr(C)]
pub struct PairAllocRef<K, V> {
    capacity: u32,
    heap: *mut u32,
    heap_counter: *mut u32,
    pairs: *mut Pair<K, V>,
    _phantom: PhantomData<(K, V)>,
}

impl<K, V> Clone for PairAllocRef<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for PairAllocRef<K, V> {}

// Safety: #[repr(C)], only plain integers and raw pointers into the pool.
unsafe impl<K: DeviceCopy, V: DeviceCopy> DeviceCopy for PairAllocRef<K, V> {}

// Safety: the cursor and heap entries are only touched through atomic word
// access; records are written exclusively by the allocating lane before
// their index is published (and read only after it is).
unsafe impl<K, V> Send for PairAllocRef<K, V> {}
unsafe impl<K, V> Sync for PairAllocRef<K, V> {}

impl<K: Copy, V: Copy> PairAllocRef<K, V> {
    /// # Safety
    ///
    /// `heap` must cover `capacity` words holding a permutation of
    /// `0..capacity`, `heap_counter` one zeroed word, and `pairs` must cover
    /// `capacity` records.
    pub const unsafe fn new(
        capacity: u32,
        heap: *mut u32,
        heap_counter: *mut u32,
        pairs: *mut Pair<K, V>,
    ) -> Self {
        Self {
            capacity,
            heap,
            heap_counter,
            pairs,
            _phantom: PhantomData,
        }
    }

    fn counter(&self) -> AtomicWord<'_, u32> {
        // Safety: `heap_counter` points at one initialized word (see `new`).
        unsafe { AtomicWord::new(self.heap_counter) }
    }

    /// Takes a free record index, or [`EMPTY_PAIR`] when the pool of
    /// `max_keyvalue_count` records is exhausted (the cursor bump is undone
    /// so later frees keep the pool consistent).
    pub fn allocate(&self) -> u32 {
        // Bounded ticket claim: the cursor never exceeds `capacity`, so a
        // racing free always lands inside the heap array.
        let mut current = self.counter().load(Ordering::Acquire);
        let index = loop {
            if current >= self.capacity {
                return EMPTY_PAIR;
            }
            let prev = self.counter().compare_and_swap(current, current + 1);
            if prev == current {
                break current;
            }
            current = prev;
        };
        // Safety: index < capacity, inside the heap array.
        let slot = unsafe { AtomicWord::new(self.heap.add(index as usize)) };
        // The slot may still be in flight from a racing free; the index is
        // handed over through the sentinel, so take whatever non-sentinel
        // value lands and leave the sentinel behind for the next free.
        loop {
            let pair = slot.load(Ordering::Acquire);
            if pair != EMPTY_PAIR && slot.compare_and_swap(pair, EMPTY_PAIR) == pair {
                return pair;
            }
            core::hint::spin_loop();
        }
    }

    /// Returns a record index to the pool.
    pub fn free(&self, pair: u32) {
        let index = self.counter().fetch_sub(1);
        // Safety: the cursor was > 0 (one live allocation per free), so
        // index - 1 < capacity.
        let slot = unsafe { AtomicWord::new(self.heap.add((index - 1) as usize)) };
        // Wait for the ticket holder of this slot to consume its index
        // before publishing the released one.
        loop {
            if slot.compare_and_swap(EMPTY_PAIR, pair) == EMPTY_PAIR {
                return;
            }
            core::hint::spin_loop();
        }
    }

    /// Constant-time record addressing.
    ///
    /// # Safety
    ///
    /// `pair` must be a live handle: either freshly allocated by this thread
    /// or observed in a slot word after its publication CAS.
    pub unsafe fn extract(&self, pair: u32) -> &Pair<K, V> {
        // Safety: live handles are < capacity by construction.
        unsafe { &*self.pairs.add(pair as usize) }
    }

    /// Fills a freshly allocated record before its index is published.
    ///
    /// # Safety
    ///
    /// `pair` must have been returned by [`allocate`](Self::allocate) on
    /// this thread and not yet published into any slot word.
    pub unsafe fn write(&self, pair: u32, record: Pair<K, V>) {
        // Safety: the allocating thread has exclusive access to the record
        // until the publication CAS makes the index visible.
        unsafe { core::ptr::write(self.pairs.add(pair as usize), record) };
    }

    /// Records currently handed out; diagnostics input.
    pub fn live_records(&self) -> u32 {
        self.counter().load(Ordering::Acquire).min(self.capacity)
    }
}

/// Host-owned pair pool.
#[cfg(not(target_arch = "nvptx64"))]
pub struct PairAlloc<K, V> {
    capacity: u32,
    heap: Storage<u32>,
    heap_counter: Storage<u32>,
    pairs: Storage<Pair<K, V>>,
}

#[cfg(not(target_arch = "nvptx64"))]
impl<K, V> PairAlloc<K, V>
where
    K: Copy + Default,
    V: Copy + Default,
{
    pub fn new(capacity: u32) -> Self {
        let mut heap = Storage::new(capacity as usize, 0u32);
        for (slot, index) in heap.as_mut_slice().iter_mut().zip(0u32..) {
            *slot = index;
        }
        Self {
            capacity,
            heap,
            heap_counter: Storage::new(1, 0u32),
            pairs: Storage::new(capacity as usize, Pair::new(K::default(), V::default())),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn alloc_ref(&self) -> PairAllocRef<K, V> {
        // Safety: the storages match the extents `PairAllocRef::new`
        // requires and stay alive (and address-stable) as long as `self`.
        unsafe {
            PairAllocRef::new(
                self.capacity,
                self.heap.ptr(),
                self.heap_counter.ptr(),
                self.pairs.ptr(),
            )
        }
    }
}

#[cfg(all(test, not(target_arch = "nvptx64")))]
mod tests {
    use super::*;

    #[test]
    fn allocate_write_extract_round_trip() {
        let pool = PairAlloc::<u32, u32>::new(4);
        let handle = pool.alloc_ref();
        let record = handle.allocate();
        assert_ne!(record, EMPTY_PAIR);
        unsafe { handle.write(record, Pair::new(7, 70)) };
        let got = unsafe { handle.extract(record) };
        assert_eq!((got.first, got.second), (7, 70));
    }

    #[test]
    fn exhaustion_yields_empty_and_free_recovers() {
        let pool = PairAlloc::<u32, u32>::new(2);
        let handle = pool.alloc_ref();
        let a = handle.allocate();
        let b = handle.allocate();
        assert_ne!(a, EMPTY_PAIR);
        assert_ne!(b, EMPTY_PAIR);
        assert_eq!(handle.allocate(), EMPTY_PAIR);
        assert_eq!(handle.live_records(), 2);

        handle.free(b);
        let c = handle.allocate();
        assert_eq!(c, b);
        assert_eq!(handle.live_records(), 2);
    }
}
