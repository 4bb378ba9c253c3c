use slab_hash::{
    Error, IdentityHash, PackedSlabHash, SlabHash, SlabHashOptions, XXHash32,
};

type IdMap = SlabHash<u32, u32, IdentityHash<u32>>;
type XxMap = SlabHash<u32, u32, XXHash32<u32>>;
type PackedIdMap = PackedSlabHash<u32, u32, IdentityHash<u32>>;

fn id_map(num_buckets: u32, max_pairs: u32) -> IdMap {
    IdMap::new(
        SlabHashOptions::new(num_buckets, max_pairs),
        IdentityHash::new(),
    )
    .expect("valid configuration")
}

fn search_all(map: &IdMap, keys: &[u32]) -> (Vec<u32>, Vec<u8>) {
    let mut values = vec![0u32; keys.len()];
    let mut founds = vec![0u8; keys.len()];
    map.search(keys, &mut values, &mut founds).unwrap();
    (values, founds)
}

mod basic_operations {
    use super::*;

    mod insert {
        use super::*;

        #[test]
        fn single_insert_then_search() {
            let mut map = id_map(16, 64);
            assert_eq!(map.insert(&[42], &[100]).unwrap(), 1);

            let (values, founds) = search_all(&map, &[42]);
            assert_eq!(founds, vec![1]);
            assert_eq!(values, vec![100]);
        }

        #[test]
        fn batch_insert_round_trip() {
            let mut map = id_map(16, 256);
            let keys: Vec<u32> = (0..100).collect();
            let values: Vec<u32> = keys.iter().map(|k| k * 10).collect();
            assert_eq!(map.insert(&keys, &values).unwrap(), 100);

            let (got, founds) = search_all(&map, &keys);
            assert!(founds.iter().all(|&f| f == 1));
            assert_eq!(got, values);
        }

        #[test]
        fn duplicate_insert_keeps_original_value() {
            let mut map = id_map(8, 64);
            assert_eq!(map.insert(&[5], &[99]).unwrap(), 1);
            assert_eq!(map.insert(&[5], &[7]).unwrap(), 0);

            let (values, founds) = search_all(&map, &[5]);
            assert_eq!(founds, vec![1]);
            assert_eq!(values, vec![99], "insert must not overwrite");
        }

        #[test]
        fn duplicates_within_one_batch_resolve_to_one_entry() {
            let mut map = id_map(8, 128);
            // Two warps' worth of the same key: one publication wins, every
            // losing pre-allocation goes back to the pool.
            let keys = vec![9u32; 64];
            let values: Vec<u32> = (0..64).collect();
            assert_eq!(map.insert(&keys, &values).unwrap(), 1);
            assert_eq!(map.live_pairs(), 1);

            let (values, founds) = search_all(&map, &[9]);
            assert_eq!(founds, vec![1]);
            assert!(values[0] < 64);
        }

        #[test]
        fn empty_batch_is_a_no_op() {
            let mut map = id_map(4, 16);
            assert_eq!(map.insert(&[], &[]).unwrap(), 0);
            assert_eq!(map.live_pairs(), 0);
        }

        #[test]
        fn mismatched_lengths_are_rejected() {
            let mut map = id_map(4, 16);
            let err = map.insert(&[1, 2], &[10]).unwrap_err();
            assert!(matches!(err, Error::LengthMismatch { .. }));
        }
    }

    mod search {
        use super::*;

        #[test]
        fn absent_key_reports_default_value() {
            let map = id_map(8, 32);
            let (values, founds) = search_all(&map, &[123]);
            assert_eq!(founds, vec![0]);
            assert_eq!(values, vec![0]);
        }

        #[test]
        fn empty_batch_is_a_no_op() {
            let map = id_map(4, 16);
            let mut values = [];
            let mut founds = [];
            map.search(&[], &mut values, &mut founds).unwrap();
        }

        #[test]
        fn mismatched_outputs_are_rejected() {
            let map = id_map(4, 16);
            let mut values = vec![0u32; 1];
            let mut founds = vec![0u8; 2];
            let err = map.search(&[1], &mut values, &mut founds).unwrap_err();
            assert!(matches!(err, Error::LengthMismatch { .. }));
        }
    }

    mod remove {
        use super::*;

        #[test]
        fn insert_remove_search_round_trip() {
            let mut map = id_map(8, 32);
            map.insert(&[7], &[70]).unwrap();
            assert_eq!(map.remove(&[7]).unwrap(), 1);

            let (_, founds) = search_all(&map, &[7]);
            assert_eq!(founds, vec![0]);
            assert_eq!(map.live_pairs(), 0);
        }

        #[test]
        fn removing_an_absent_key_is_idempotent() {
            let mut map = id_map(8, 32);
            assert_eq!(map.remove(&[1]).unwrap(), 0);
            assert_eq!(map.remove(&[1]).unwrap(), 0);
        }

        #[test]
        fn double_remove_in_one_batch_frees_exactly_once() {
            let mut map = id_map(8, 32);
            map.insert(&[7], &[70]).unwrap();
            assert_eq!(map.remove(&[7, 7]).unwrap(), 1);
            assert_eq!(map.live_pairs(), 0);
        }

        #[test]
        fn removed_slot_is_reused_by_a_later_insert() {
            let mut map = id_map(1, 64);
            map.insert(&[1, 2, 3], &[10, 20, 30]).unwrap();
            map.remove(&[2]).unwrap();
            assert_eq!(map.insert(&[33], &[330]).unwrap(), 1);

            let (values, founds) = search_all(&map, &[1, 2, 3, 33]);
            assert_eq!(founds, vec![1, 0, 1, 1]);
            assert_eq!(values, vec![10, 0, 30, 330]);
        }
    }
}

mod configuration {
    use super::*;

    #[test]
    fn zero_buckets_is_invalid() {
        let result = IdMap::new(SlabHashOptions::new(0, 16), IdentityHash::new());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn zero_pair_capacity_is_invalid() {
        let result = IdMap::new(SlabHashOptions::new(16, 0), IdentityHash::new());
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn options_record_the_device_index() {
        let options = SlabHashOptions::new(4, 16).device_index(0).seed(7);
        assert_eq!(options.seed, 7);

        let map = IdMap::new(options, IdentityHash::new()).unwrap();
        assert_eq!(map.device_index(), 0);
        assert_eq!(map.num_buckets(), 4);
        assert_eq!(map.max_keyvalue_count(), 16);
    }

    #[test]
    fn seeded_options_shuffle_buckets_but_preserve_contents() {
        for seed in [0u32, 1, 0xdead_beef] {
            let mut map =
                XxMap::with_default_hasher(SlabHashOptions::new(32, 256).seed(seed)).unwrap();
            let keys: Vec<u32> = (0..200).collect();
            let values: Vec<u32> = keys.iter().map(|k| k + 1000).collect();
            assert_eq!(map.insert(&keys, &values).unwrap(), 200);

            let mut got = vec![0u32; keys.len()];
            let mut founds = vec![0u8; keys.len()];
            map.search(&keys, &mut got, &mut founds).unwrap();
            assert!(founds.iter().all(|&f| f == 1));
            assert_eq!(got, values);
        }
    }
}

mod scenarios {
    use super::*;

    /// One bucket, three entries, one miss.
    #[test]
    fn small_table_with_one_bucket() {
        let mut map = id_map(1, 64);
        map.insert(&[1, 2, 3], &[10, 20, 30]).unwrap();

        let (values, founds) = search_all(&map, &[1, 2, 3, 4]);
        assert_eq!(values, vec![10, 20, 30, 0]);
        assert_eq!(founds, vec![1, 1, 1, 0]);
    }

    /// 32 keys into one bucket saturate the head slab's 31 pair slots; the
    /// 32nd key grows the chain to length 2, which the load-factor
    /// denominator exposes exactly: 32 * 8 bytes over 2 slabs * 128 bytes.
    #[test]
    fn chain_grows_past_the_head_slab() {
        let mut map = id_map(1, 64);
        let keys: Vec<u32> = (0..32).collect();
        let values: Vec<u32> = keys.iter().map(|k| k * 2).collect();
        assert_eq!(map.insert(&keys, &values).unwrap(), 32);

        let (got, founds) = search_all(&map, &keys);
        assert!(founds.iter().all(|&f| f == 1));
        assert_eq!(got, values);

        let lf = map.compute_load_factor();
        assert!((lf - 1.0).abs() < 1e-9, "expected exactly 2 slabs, lf={lf}");
    }

    /// 1000 keys, odds removed: evens stay searchable and the load factor
    /// reflects exactly the 500 survivors.
    #[test]
    fn thousand_keys_remove_odds() {
        let mut map = id_map(64, 2000);
        let keys: Vec<u32> = (0..1000).collect();
        let values: Vec<u32> = keys.iter().map(|k| k * 3).collect();
        assert_eq!(map.insert(&keys, &values).unwrap(), 1000);

        let odds: Vec<u32> = keys.iter().copied().filter(|k| k % 2 == 1).collect();
        assert_eq!(map.remove(&odds).unwrap(), 500);
        assert_eq!(map.live_pairs(), 500);

        let (got, founds) = search_all(&map, &keys);
        for (k, (&v, &f)) in keys.iter().zip(got.iter().zip(founds.iter())) {
            if k % 2 == 0 {
                assert_eq!((v, f), (k * 3, 1), "even key {k} must survive");
            } else {
                assert_eq!((v, f), (0, 0), "odd key {k} must be gone");
            }
        }

        // 1000 identity-hashed keys over 64 buckets stay below 31 per head
        // slab, so no chain slabs exist: 500 * 8 / (64 * 128).
        let lf = map.compute_load_factor();
        assert!((lf - 0.48828125).abs() < 1e-9, "lf={lf}");
    }

    /// All 32 lanes of one warp insert the same key: exactly one wins and
    /// every losing pre-allocation returns to the pool.
    #[test]
    fn warp_race_on_one_key() {
        let mut map = id_map(4, 33);
        let keys = vec![42u32; 32];
        let values: Vec<u32> = (100..132).collect();
        assert_eq!(map.insert(&keys, &values).unwrap(), 1);
        assert_eq!(map.live_pairs(), 1);

        let (got, founds) = search_all(&map, &[42]);
        assert_eq!(founds, vec![1]);
        assert!((100..132).contains(&got[0]));

        // The 31 returned records are immediately reusable.
        let more_keys: Vec<u32> = (0..32).collect();
        let more_values: Vec<u32> = (0..32).collect();
        assert_eq!(map.insert(&more_keys, &more_values).unwrap(), 32);
    }

    /// Filling the pair pool makes the next insert a per-key no-op; nothing
    /// else is disturbed.
    #[test]
    fn pair_pool_exhaustion_is_best_effort() {
        let mut map = id_map(8, 8);
        let keys: Vec<u32> = (0..8).collect();
        let values: Vec<u32> = (0..8).collect();
        assert_eq!(map.insert(&keys, &values).unwrap(), 8);
        assert_eq!(map.live_pairs(), 8);

        assert_eq!(map.insert(&[100], &[1]).unwrap(), 0);
        let (_, founds) = search_all(&map, &[100]);
        assert_eq!(founds, vec![0]);

        let (_, founds) = search_all(&map, &keys);
        assert!(founds.iter().all(|&f| f == 1));

        // Remove one record and the pool accepts the key that failed.
        map.remove(&[0]).unwrap();
        assert_eq!(map.insert(&[100], &[1]).unwrap(), 1);
    }

    /// Slab-pool exhaustion: with two chain slabs the single bucket holds
    /// 93 records; the 94th needs a third slab and reports not-inserted.
    #[test]
    fn slab_pool_exhaustion_is_best_effort() {
        let mut map = IdMap::new(
            SlabHashOptions::new(1, 200).max_slab_count(2),
            IdentityHash::new(),
        )
        .unwrap();

        // Three single-warp batches keep slab growth deterministic.
        for batch in 0..3u32 {
            let keys: Vec<u32> = (batch * 31..batch * 31 + 31).collect();
            let values = keys.clone();
            assert_eq!(map.insert(&keys, &values).unwrap(), 31);
        }
        assert_eq!(map.live_pairs(), 93);

        assert_eq!(map.insert(&[93], &[93]).unwrap(), 0);
        assert_eq!(map.live_pairs(), 93);
        let (_, founds) = search_all(&map, &[93]);
        assert_eq!(founds, vec![0]);

        // Everything that fit is still there.
        let keys: Vec<u32> = (0..93).collect();
        let (_, founds) = search_all(&map, &keys);
        assert!(founds.iter().all(|&f| f == 1));
    }
}

mod packed_variant {
    use super::*;

    fn packed_map(num_buckets: u32, max_pairs: u32) -> PackedIdMap {
        PackedIdMap::new(
            SlabHashOptions::new(num_buckets, max_pairs),
            IdentityHash::new(),
        )
        .unwrap()
    }

    #[test]
    fn insert_search_remove_round_trip() {
        let mut map = packed_map(8, 64);
        let keys: Vec<u32> = (0..40).collect();
        let values: Vec<u32> = keys.iter().map(|k| k + 7).collect();
        assert_eq!(map.insert(&keys, &values).unwrap(), 40);

        let mut got = vec![0u32; keys.len()];
        let mut founds = vec![0u8; keys.len()];
        map.search(&keys, &mut got, &mut founds).unwrap();
        assert!(founds.iter().all(|&f| f == 1));
        assert_eq!(got, values);

        assert_eq!(map.remove(&[0, 1, 2]).unwrap(), 3);
        map.search(&[0, 1, 2, 3], &mut got[..4], &mut founds[..4])
            .unwrap();
        assert_eq!(&founds[..4], &[0, 0, 0, 1]);
    }

    #[test]
    fn packed_insert_does_not_overwrite() {
        let mut map = packed_map(4, 16);
        assert_eq!(map.insert(&[5], &[99]).unwrap(), 1);
        assert_eq!(map.insert(&[5], &[7]).unwrap(), 0);

        let mut values = vec![0u32; 1];
        let mut founds = vec![0u8; 1];
        map.search(&[5], &mut values, &mut founds).unwrap();
        assert_eq!((values[0], founds[0]), (99, 1));
    }

    /// Same chain-growth shape as the index-addressed variant, but over
    /// 64-bit slots: 32 * 8 bytes over 2 slabs * 256 bytes.
    #[test]
    fn packed_chain_growth_and_load_factor() {
        let mut map = packed_map(1, 64);
        let keys: Vec<u32> = (0..32).collect();
        let values = keys.clone();
        assert_eq!(map.insert(&keys, &values).unwrap(), 32);

        let lf = map.compute_load_factor();
        assert!((lf - 0.5).abs() < 1e-9, "lf={lf}");
    }

    #[test]
    fn packed_warp_race_on_one_key() {
        let mut map = PackedSlabHash::<u32, u32, XXHash32<u32>>::with_default_hasher(
            SlabHashOptions::new(4, 64).seed(3),
        )
        .unwrap();
        let keys = vec![42u32; 32];
        let values: Vec<u32> = (200..232).collect();
        assert_eq!(map.insert(&keys, &values).unwrap(), 1);

        let mut got = vec![0u32; 1];
        let mut founds = vec![0u8; 1];
        map.search(&[42], &mut got, &mut founds).unwrap();
        assert_eq!(founds, vec![1]);
        assert!((200..232).contains(&got[0]));
    }
}

mod randomized {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    /// Random keys through insert/remove/search stay consistent with a
    /// sequential model of the same batches.
    #[test]
    fn random_batches_match_set_semantics() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
        let mut map = XxMap::new(SlabHashOptions::new(32, 1000), XXHash32::new(11)).unwrap();

        let mut keys: Vec<u32> = (0..600).map(|_| rng.gen_range(0..100_000)).collect();
        keys.sort_unstable();
        keys.dedup();
        keys.shuffle(&mut rng);
        let values: Vec<u32> = keys.iter().map(|k| k ^ 0xa5a5_a5a5).collect();

        assert_eq!(map.insert(&keys, &values).unwrap(), keys.len());

        let mut removed: Vec<u32> = keys
            .iter()
            .copied()
            .filter(|_| rng.gen_bool(0.5))
            .collect();
        removed.shuffle(&mut rng);
        assert_eq!(map.remove(&removed).unwrap(), removed.len());

        let removed_set: std::collections::HashSet<u32> = removed.iter().copied().collect();
        let mut got = vec![0u32; keys.len()];
        let mut founds = vec![0u8; keys.len()];
        map.search(&keys, &mut got, &mut founds).unwrap();
        for (i, k) in keys.iter().enumerate() {
            if removed_set.contains(k) {
                assert_eq!(founds[i], 0, "removed key {k} resurfaced");
            } else {
                assert_eq!(founds[i], 1, "kept key {k} vanished");
                assert_eq!(got[i], k ^ 0xa5a5_a5a5);
            }
        }
        assert_eq!(map.live_pairs() as usize, keys.len() - removed_set.len());
    }
}
