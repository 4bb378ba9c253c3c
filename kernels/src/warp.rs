//! Warp-wide primitives.
//!
//! Under `nvptx64` these forward to the hardware intrinsics. On the host
//! they are backed by a lockstep executor: each simulated warp is 32 threads
//! sharing a 32-slot exchange array and a barrier, so every primitive is a
//! full-warp rendezvous. The protocol contract is the same on both targets:
//! every lane must reach every warp-wide primitive along the same
//! control-flow path. A lane that leaves the work-queue loop early stalls
//! its warp at the next rendezvous instead of corrupting the table.

/// Lanes per warp; also the number of words per slab.
pub const WARP_WIDTH: u32 = 32;

/// All lanes participate in every warp-wide primitive.
pub const ACTIVE_LANES_MASK: u32 = 0xffff_ffff;

/// Lanes 0..=30 read pair slots; lane 31 reads the next-slab pointer.
pub const PAIR_SLOT_LANES_MASK: u32 = 0x7fff_ffff;

/// The lane whose slab word is the next-slab pointer.
pub const NEXT_SLAB_LANE: u32 = 31;

/// `__ffs(mask) - 1`: index of the lowest set bit, or -1 when none.
#[inline(always)]
pub fn find_first_set(mask: u32) -> i32 {
    if mask == 0 {
        -1
    } else {
        mask.trailing_zeros() as i32
    }
}

#[cfg(target_arch = "nvptx64")]
mod imp {
    use cuda_std::warp;

    #[inline(always)]
    pub fn lane_id() -> u32 {
        warp::lane_id()
    }

    /// Ballot of `pred` across the full warp.
    #[inline(always)]
    pub fn ballot(pred: bool) -> u32 {
        // Safety: the protocol loops keep the warp converged at every
        // warp-wide primitive (see module docs).
        unsafe { warp::warp_vote_ballot(super::ACTIVE_LANES_MASK, pred) }
    }

    /// Broadcasts a 32-bit word from `src_lane` to every lane.
    #[inline(always)]
    pub fn shuffle(value: u32, src_lane: u32) -> u32 {
        // Safety: as in `ballot`; `src_lane` is always < 32.
        unsafe {
            warp::warp_shuffle_idx(super::ACTIVE_LANES_MASK, value, src_lane, super::WARP_WIDTH).0
        }
    }

    /// Broadcasts a 64-bit word from `src_lane` to every lane.
    #[inline(always)]
    pub fn shuffle_wide(value: u64, src_lane: u32) -> u64 {
        // Safety: as in `shuffle`.
        unsafe {
            warp::warp_shuffle_idx(super::ACTIVE_LANES_MASK, value, src_lane, super::WARP_WIDTH).0
        }
    }
}

#[cfg(not(target_arch = "nvptx64"))]
mod imp {
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Barrier};

    use super::WARP_WIDTH;

    /// Shared state of one simulated warp: an exchange slot per lane and a
    /// barrier that stands in for instruction lockstep.
    struct Exchange {
        slots: [AtomicU64; WARP_WIDTH as usize],
        barrier: Barrier,
    }

    impl Exchange {
        fn new() -> Self {
            Self {
                slots: core::array::from_fn(|_| AtomicU64::new(0)),
                barrier: Barrier::new(WARP_WIDTH as usize),
            }
        }
    }

    struct LaneBinding {
        warp: Arc<Exchange>,
        lane: u32,
    }

    thread_local! {
        static LANE: RefCell<Option<LaneBinding>> = const { RefCell::new(None) };
    }

    fn with_lane<R>(f: impl FnOnce(&Exchange, u32) -> R) -> R {
        LANE.with(|slot| {
            let bound = slot.borrow();
            let bound = bound
                .as_ref()
                .expect("warp primitive called outside a lane launched by warp::launch");
            f(&bound.warp, bound.lane)
        })
    }

    pub fn lane_id() -> u32 {
        with_lane(|_, lane| lane)
    }

    /// One full exchange round: publish, rendezvous, read, rendezvous. The
    /// second barrier keeps a fast lane from overwriting slots a slow lane
    /// has not read yet.
    fn exchange_round<R>(mine: u64, read: impl FnOnce(&Exchange) -> R) -> R {
        with_lane(|warp, lane| {
            warp.slots[lane as usize].store(mine, Ordering::Release);
            warp.barrier.wait();
            let out = read(warp);
            warp.barrier.wait();
            out
        })
    }

    /// Ballot of `pred` across the full warp.
    pub fn ballot(pred: bool) -> u32 {
        exchange_round(pred as u64, |warp| {
            let mut mask = 0u32;
            for (i, slot) in warp.slots.iter().enumerate() {
                if slot.load(Ordering::Acquire) != 0 {
                    mask |= 1 << i;
                }
            }
            mask
        })
    }

    /// Broadcasts a 32-bit word from `src_lane` to every lane.
    pub fn shuffle(value: u32, src_lane: u32) -> u32 {
        exchange_round(value as u64, |warp| {
            warp.slots[src_lane as usize].load(Ordering::Acquire) as u32
        })
    }

    /// Broadcasts a 64-bit word from `src_lane` to every lane.
    pub fn shuffle_wide(value: u64, src_lane: u32) -> u64 {
        exchange_round(value, |warp| {
            warp.slots[src_lane as usize].load(Ordering::Acquire)
        })
    }

    /// Runs `warps` simulated warps to completion. Each of the `32 * warps`
    /// lane threads executes `body(warp_id, lane_id)`; all warps run
    /// concurrently, so cross-warp interleavings are real.
    pub fn launch<F>(warps: u32, body: F)
    where
        F: Fn(u32, u32) + Sync,
    {
        std::thread::scope(|scope| {
            for warp_id in 0..warps {
                let exchange = Arc::new(Exchange::new());
                for lane in 0..WARP_WIDTH {
                    let exchange = Arc::clone(&exchange);
                    let body = &body;
                    scope.spawn(move || {
                        LANE.with(|slot| {
                            *slot.borrow_mut() = Some(LaneBinding {
                                warp: exchange,
                                lane,
                            });
                        });
                        body(warp_id, lane);
                        LANE.with(|slot| {
                            *slot.borrow_mut() = None;
                        });
                    });
                }
            }
        });
    }
}

pub use imp::{ballot, lane_id, shuffle, shuffle_wide};

#[cfg(not(target_arch = "nvptx64"))]
pub use imp::launch;

/// Broadcasts `key` from `src_lane` to every lane, one 32-bit chunk at a
/// time. Key sizes are a non-zero multiple of 4 bytes (enforced by the
/// table's layout check), so every byte of the result is written.
pub fn shuffle_key<K: Copy>(key: &K, src_lane: u32) -> K {
    let chunks = core::mem::size_of::<K>() / 4;
    let mut out = core::mem::MaybeUninit::<K>::uninit();
    let src = key as *const K as *const u32;
    let dst = out.as_mut_ptr() as *mut u32;
    for i in 0..chunks {
        // Safety: `i < size_of::<K>() / 4`, so both accesses stay inside one
        // K; unaligned reads/writes tolerate keys with sub-word alignment.
        let chunk = unsafe { core::ptr::read_unaligned(src.add(i)) };
        let got = shuffle(chunk, src_lane);
        unsafe { core::ptr::write_unaligned(dst.add(i), got) };
    }
    // Safety: all `chunks * 4 == size_of::<K>()` bytes were written above.
    unsafe { out.assume_init() }
}

#[cfg(all(test, not(target_arch = "nvptx64")))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn ballot_collects_every_lane() {
        let seen = AtomicU32::new(0);
        launch(1, |_, lane| {
            let mask = ballot(lane % 2 == 0);
            if lane == 0 {
                seen.store(mask, Ordering::Relaxed);
            }
        });
        assert_eq!(seen.load(Ordering::Relaxed), 0x5555_5555);
    }

    #[test]
    fn shuffle_broadcasts_source_lane() {
        let ok = AtomicU32::new(0);
        launch(1, |_, lane| {
            let got = shuffle(lane * 10, 7);
            if got == 70 {
                ok.fetch_add(1, Ordering::Relaxed);
            }
        });
        assert_eq!(ok.load(Ordering::Relaxed), WARP_WIDTH);
    }

    #[test]
    fn shuffle_key_moves_wide_keys() {
        let ok = AtomicU32::new(0);
        launch(1, |_, lane| {
            let key = [lane, lane + 1, lane + 2];
            let got = shuffle_key(&key, 3);
            if got == [3, 4, 5] {
                ok.fetch_add(1, Ordering::Relaxed);
            }
        });
        assert_eq!(ok.load(Ordering::Relaxed), WARP_WIDTH);
    }

    #[test]
    fn warps_are_independent() {
        let sum = AtomicU32::new(0);
        launch(4, |warp_id, lane| {
            let mask = ballot(true);
            let head = shuffle(warp_id * 100, 0);
            if lane == 0 {
                assert_eq!(mask, ACTIVE_LANES_MASK);
                sum.fetch_add(head, Ordering::Relaxed);
            }
        });
        assert_eq!(sum.load(Ordering::Relaxed), 600);
    }
}
