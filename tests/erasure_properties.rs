//! Property-based tests for erasure coding and stripe placement.

use cloudstripe::backend::BackendId;
use cloudstripe::erasure::{Encoder, Fragment, StripePlanner};
use cloudstripe::Error;
use proptest::prelude::*;

/// (k, m) pairs within a practical range
fn any_geometry() -> impl Strategy<Value = (usize, usize)> {
    (1usize..=8, 1usize..=4)
}

fn any_payload() -> impl Strategy<Value = Vec<u8>> {
    proptest::collection::vec(any::<u8>(), 0..4096)
}

/// Geometry, payload and a set of m fragment indices to drop
fn erasure_case() -> impl Strategy<Value = ((usize, usize), Vec<u8>, Vec<usize>)> {
    (any_geometry(), any_payload()).prop_flat_map(|((k, m), data)| {
        let lost = proptest::sample::subsequence((0..k + m).collect::<Vec<_>>(), m);
        (Just((k, m)), Just(data), lost)
    })
}

proptest! {
    /// Any k surviving fragments rebuild the payload byte for byte
    #[test]
    fn test_decode_from_any_k(((k, m), data, lost) in erasure_case()) {
        let encoder = Encoder::new(k, m).unwrap();
        let encoded = encoder.encode(&data).unwrap();

        prop_assert_eq!(encoded.fragments.len(), k + m);
        prop_assert!(encoded.fragments.iter().all(|f| f.data.len() == encoded.shard_len));

        let survivors: Vec<Fragment> = encoded
            .fragments
            .iter()
            .filter(|f| !lost.contains(&f.index))
            .cloned()
            .collect();
        prop_assert_eq!(survivors.len(), k);

        let decoded = encoder.decode(&survivors, encoded.shard_len, encoded.padding).unwrap();
        prop_assert_eq!(decoded, data);
    }

    /// Losing more than m fragments is always detected
    #[test]
    fn test_too_few_fragments_rejected(((k, m), data, _lost) in erasure_case()) {
        let encoder = Encoder::new(k, m).unwrap();
        let encoded = encoder.encode(&data).unwrap();

        let survivors: Vec<Fragment> = encoded.fragments[..k - 1].to_vec();
        let result = encoder.decode(&survivors, encoded.shard_len, encoded.padding);
        let is_insufficient = matches!(result, Err(Error::InsufficientFragments { .. }));
        prop_assert!(is_insufficient);
    }

    /// A flipped byte in any fragment is reported as corruption
    #[test]
    fn test_corruption_detected(
        ((k, m), data, _lost) in erasure_case(),
        victim in any::<prop::sample::Index>(),
    ) {
        let encoder = Encoder::new(k, m).unwrap();
        let mut encoded = encoder.encode(&data).unwrap();
        let index = victim.index(k + m);

        let mut bytes = encoded.fragments[index].data.to_vec();
        bytes[0] ^= 0x01;
        let original = &encoded.fragments[index];
        let tampered =
            Fragment::with_checksum(original.index, original.role, bytes.into(), original.checksum.clone());
        encoded.fragments[index] = tampered;

        let result = encoder.decode(&encoded.fragments, encoded.shard_len, encoded.padding);
        let is_corrupt = matches!(result, Err(Error::CorruptFragment { .. }));
        prop_assert!(is_corrupt);
    }

    /// Round-robin placement never puts two more fragments on one backend than on another
    #[test]
    fn test_round_robin_balanced((k, m) in any_geometry(), backends in 1usize..=6) {
        let placement: Vec<BackendId> = (0..backends).map(|i| BackendId::new(format!("b{}", i))).collect();
        let planner = StripePlanner::new(k, k + m);
        let assigned = planner.assign_round_robin(&placement).unwrap();

        prop_assert_eq!(assigned.len(), k + m);
        let counts: Vec<usize> = placement
            .iter()
            .map(|b| assigned.iter().filter(|a| *a == b).count())
            .collect();
        let max = counts.iter().copied().max().unwrap_or(0);
        let min = counts.iter().copied().min().unwrap_or(0);
        prop_assert!(max - min <= 1);
    }
}
