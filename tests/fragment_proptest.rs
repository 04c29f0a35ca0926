use proptest::prelude::*;
use std::time::Instant;
use veil_core::fragment::{Defragmenter, split_message};
use veil_core::identity::PeerId;
use veil_core::protocol::FragmentId;

proptest! {
    /// Any message up to 4 KiB, split at any MTU of at least 64 bytes
    /// and fed back in any order, reassembles to exactly the original.
    #[test]
    fn split_and_reassemble_any_order(
        len in 1usize..4096,
        mtu in 64usize..1500,
        seed in any::<u64>(),
    ) {
        let message: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let mut frags = split_message(FragmentId(42), mtu, &message);
        // Deterministic shuffle from the seed.
        let mut state = seed | 1;
        for i in (1..frags.len()).rev() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            let j = (state >> 33) as usize % (i + 1);
            frags.swap(i, j);
        }

        let sender = PeerId::from_bytes([3; 64]);
        let mut defrag = Defragmenter::new();
        let now = Instant::now();
        let mut result = None;
        let total = frags.len();
        for (i, frag) in frags.into_iter().enumerate() {
            match defrag.add_fragment(&sender, frag, now) {
                Some(out) => {
                    prop_assert_eq!(i + 1, total, "completed before all fragments fed");
                    result = Some(out);
                }
                None => prop_assert!(i + 1 < total, "incomplete after all fragments"),
            }
        }
        prop_assert_eq!(result.expect("reassembled"), message);
    }

    /// Duplicated fragments never corrupt the reassembled output.
    #[test]
    fn duplicates_are_harmless(len in 2usize..2048, mtu in 64usize..512) {
        let message: Vec<u8> = (0..len).map(|i| (i % 241) as u8).collect();
        let frags = split_message(FragmentId(7), mtu, &message);
        let sender = PeerId::from_bytes([5; 64]);
        let mut defrag = Defragmenter::new();
        let now = Instant::now();
        let mut result = None;
        for frag in frags.iter().flat_map(|f| [f, f]) {
            if let Some(out) = defrag.add_fragment(&sender, frag.clone(), now) {
                result = Some(out);
                break;
            }
        }
        prop_assert_eq!(result.expect("reassembled"), message);
    }
}
