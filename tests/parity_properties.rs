//! Property-based checks for the codec laws and the aggregation
//! invariants the engine must uphold.

mod common;

use common::Cluster;
use proptest::prelude::*;

use ecagg::codec::{xor_diff, xor_into, Codec};
use ecagg::types::ClassAttr;
use ecagg::{EpochRange, Extent};

/// Deterministic byte stream so data size can depend on the drawn geometry.
fn byte_at(seed: u64, i: usize) -> u8 {
    let mut x = seed ^ (i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x ^= x >> 27;
    (x & 0xff) as u8
}

fn geometry() -> impl Strategy<Value = (u16, u16, u32, u64)> {
    (2u16..=6, 1u16..=2, 1u32..=8, 1u64..=4)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Any k-1 data cells plus one parity row reproduce the missing cell
    /// byte for byte.
    #[test]
    fn prop_recover_any_missing_cell(
        (k, p, len, rsize) in geometry(),
        seed in any::<u64>(),
    ) {
        let attr = ClassAttr::new(1, k, p, len);
        let codec = Codec::new(attr).unwrap();
        let cell_bytes = attr.cell_bytes(rsize);
        let data: Vec<u8> = (0..k as usize * cell_bytes)
            .map(|i| byte_at(seed, i))
            .collect();
        let cells: Vec<&[u8]> = data.chunks_exact(cell_bytes).collect();
        let mut parity = vec![0u8; p as usize * cell_bytes];
        codec.encode(cell_bytes, &cells, &mut parity).unwrap();

        for missing in 0..k as usize {
            for row in 0..p as usize {
                let slots: Vec<Option<&[u8]>> = cells
                    .iter()
                    .enumerate()
                    .map(|(i, c)| if i == missing { None } else { Some(*c) })
                    .collect();
                let mut out = vec![0u8; cell_bytes];
                codec
                    .recover(
                        cell_bytes,
                        missing,
                        &slots,
                        row,
                        &parity[row * cell_bytes..(row + 1) * cell_bytes],
                        &mut out,
                    )
                    .unwrap();
                prop_assert_eq!(&out[..], cells[missing]);
            }
        }
    }

    /// Folding XOR diffs for a set of rewritten cells yields the same
    /// parity bytes as re-encoding the stripe from scratch.
    #[test]
    fn prop_update_commutes_with_recalc(
        (k, p, len, rsize) in geometry(),
        seed in any::<u64>(),
    ) {
        let attr = ClassAttr::new(1, k, p, len);
        let codec = Codec::new(attr).unwrap();
        let cell_bytes = attr.cell_bytes(rsize);
        let total = k as usize * cell_bytes;
        let old: Vec<u8> = (0..total).map(|i| byte_at(seed, i)).collect();
        let mask = (seed % ((1u64 << k) - 1)) + 1; // at least one cell rewritten

        let mut new = old.clone();
        for cell in 0..k as usize {
            if mask & (1u64 << cell) != 0 {
                for b in &mut new[cell * cell_bytes..(cell + 1) * cell_bytes] {
                    *b = byte_at(!seed, *b as usize + cell);
                }
            }
        }

        // Incremental path.
        let old_cells: Vec<&[u8]> = old.chunks_exact(cell_bytes).collect();
        let mut parity = vec![0u8; p as usize * cell_bytes];
        codec.encode(cell_bytes, &old_cells, &mut parity).unwrap();
        let mut diff = vec![0u8; cell_bytes];
        for cell in 0..k as usize {
            if mask & (1u64 << cell) == 0 {
                continue;
            }
            xor_diff(
                &old[cell * cell_bytes..(cell + 1) * cell_bytes],
                &new[cell * cell_bytes..(cell + 1) * cell_bytes],
                &mut diff,
            );
            codec.encode_update(cell_bytes, cell, &diff, &mut parity).unwrap();
        }

        // Recalc path.
        let new_cells: Vec<&[u8]> = new.chunks_exact(cell_bytes).collect();
        let mut expected = vec![0u8; p as usize * cell_bytes];
        codec.encode(cell_bytes, &new_cells, &mut expected).unwrap();

        prop_assert_eq!(parity, expected);
    }

    /// The XOR diff law: for every updated cell, the new parity row is the
    /// old row XOR the update's contribution for that row.
    #[test]
    fn prop_xor_diff_law(
        (k, p, len, rsize) in geometry(),
        seed in any::<u64>(),
        cell in 0usize..6,
    ) {
        let cell = cell % k as usize;
        let attr = ClassAttr::new(1, k, p, len);
        let codec = Codec::new(attr).unwrap();
        let cell_bytes = attr.cell_bytes(rsize);
        let old: Vec<u8> = (0..k as usize * cell_bytes).map(|i| byte_at(seed, i)).collect();
        let cells: Vec<&[u8]> = old.chunks_exact(cell_bytes).collect();
        let mut old_parity = vec![0u8; p as usize * cell_bytes];
        codec.encode(cell_bytes, &cells, &mut old_parity).unwrap();

        let diff: Vec<u8> = (0..cell_bytes).map(|i| byte_at(seed ^ 0xdead, i)).collect();

        // The update's contribution in isolation.
        let mut contribution = vec![0u8; p as usize * cell_bytes];
        codec.encode_update(cell_bytes, cell, &diff, &mut contribution).unwrap();

        // Applied to the live parity.
        let mut updated = old_parity.clone();
        codec.encode_update(cell_bytes, cell, &diff, &mut updated).unwrap();

        for row in 0..p as usize {
            let mut expected = old_parity[row * cell_bytes..(row + 1) * cell_bytes].to_vec();
            xor_into(&mut expected, &contribution[row * cell_bytes..(row + 1) * cell_bytes]);
            prop_assert_eq!(&updated[row * cell_bytes..(row + 1) * cell_bytes], &expected[..]);
        }
    }
}

// =============================================================================
// Engine-Level Invariants
// =============================================================================

/// Per-stripe load shape for the engine property below.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StripeLoad {
    Empty,
    Partial,
    Full,
}

fn stripe_loads() -> impl Strategy<Value = Vec<StripeLoad>> {
    prop::collection::vec(
        prop_oneof![
            Just(StripeLoad::Empty),
            Just(StripeLoad::Partial),
            Just(StripeLoad::Full),
        ],
        1..5,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// For stripe-aligned replica sets: every fully replicated stripe ends
    /// up with exactly one parity extent at the stripe's epoch high-water
    /// and zero data extents, the parity decodes back to the data, and
    /// partially replicated stripes are left alone.
    #[test]
    fn prop_engine_encode_invariants(loads in stripe_loads(), seed in any::<u64>()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let cluster = Cluster::new(2, 1, 4);
            let attr = cluster.attr;
            let stripe_recs = attr.stripe_recs();

            let mut contents: Vec<Option<(u64, Vec<u8>)>> = Vec::new();
            for (s, load) in loads.iter().enumerate() {
                let epoch = s as u64 + 1;
                let start = s as u64 * stripe_recs;
                match load {
                    StripeLoad::Empty => contents.push(None),
                    StripeLoad::Partial => {
                        let data: Vec<u8> =
                            (0..4).map(|i| byte_at(seed, s * 100 + i)).collect();
                        cluster.write_leader(epoch, Extent::new(start, 4), &data);
                        contents.push(None);
                    }
                    StripeLoad::Full => {
                        let data: Vec<u8> = (0..stripe_recs as usize)
                            .map(|i| byte_at(seed, s * 100 + i))
                            .collect();
                        cluster.write_leader(epoch, Extent::new(start, stripe_recs), &data);
                        contents.push(Some((epoch, data)));
                    }
                }
            }

            let summary = cluster.agg.aggregate(EpochRange::new(0, 100)).await.unwrap();
            let expected_encoded =
                loads.iter().filter(|l| **l == StripeLoad::Full).count() as u64;
            assert_eq!(summary.stripes_encoded, expected_encoded);

            let leftover = cluster.leader_extents().await;
            let codec = Codec::new(attr).unwrap();
            for (s, load) in loads.iter().enumerate() {
                let probe = cluster.leader_parity_probe(s as u64).await;
                match load {
                    StripeLoad::Full => {
                        let (epoch, data) = contents[s].as_ref().unwrap();
                        assert_eq!(probe.epoch, *epoch);
                        let parity = cluster.leader_parity_cell(*epoch, s as u64).await;
                        // Decode round-trip: parity + cell 1 reproduce cell 0.
                        let slots = [None, Some(&data[4..8])];
                        let mut out = vec![0u8; 4];
                        codec
                            .recover(4, 0, &slots, 0, &parity, &mut out)
                            .unwrap();
                        assert_eq!(out, &data[..4]);
                        // No data extents remain in the stripe.
                        let start = s as u64 * stripe_recs;
                        assert!(leftover
                            .iter()
                            .all(|(idx, count, _, _)| idx + count <= start
                                || *idx >= start + stripe_recs));
                    }
                    StripeLoad::Partial => {
                        assert!(probe.is_absent());
                        let start = s as u64 * stripe_recs;
                        assert!(leftover.iter().any(|(idx, _, _, _)| *idx == start));
                    }
                    StripeLoad::Empty => assert!(probe.is_absent()),
                }
            }
        });
    }
}
