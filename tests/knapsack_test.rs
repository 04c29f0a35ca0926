use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use std::time::Instant;
use veil_core::entry::{BufferEntry, Placement, SendEntry};
use veil_core::identity::PeerId;
use veil_core::scheduler::{approximate_knapsack, solve_knapsack};

fn entry_with(lens_pris: &[(usize, u32)]) -> BufferEntry {
    let mut be = BufferEntry::new(PeerId::from_bytes([1; 64]), Instant::now());
    let now = Instant::now();
    for &(len, pri) in lens_pris {
        be.enqueue(SendEntry::ready(vec![0; len], pri, now, Placement::None));
    }
    be
}

/// Exhaustive reference: best achievable priority over all subsets.
fn brute_force(items: &[(usize, u32)], capacity: usize) -> u64 {
    let mut best = 0u64;
    for mask in 0u32..(1 << items.len()) {
        let mut size = 0usize;
        let mut priority = 0u64;
        for (i, &(len, pri)) in items.iter().enumerate() {
            if mask & (1 << i) != 0 {
                size += len;
                priority += pri as u64;
            }
        }
        if size <= capacity {
            best = best.max(priority);
        }
    }
    best
}

#[test]
fn solver_matches_brute_force_on_random_instances() {
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);
    for _ in 0..200 {
        let count = rng.gen_range(1..=8);
        let items: Vec<(usize, u32)> = (0..count)
            .map(|_| (rng.gen_range(1..=600), rng.gen_range(0..=50)))
            .collect();
        let capacity = rng.gen_range(64..=1400);

        let mut be = entry_with(&items);
        let achieved = solve_knapsack(&mut be.send_buffer, capacity);

        let selected_size: usize = be
            .send_buffer
            .iter()
            .filter(|e| e.selected)
            .map(|e| e.len)
            .sum();
        let selected_priority: u64 = be
            .send_buffer
            .iter()
            .filter(|e| e.selected)
            .map(|e| e.priority as u64)
            .sum();

        assert!(selected_size <= capacity, "overcommitted {selected_size} > {capacity}");
        assert_eq!(achieved, selected_priority, "reported priority mismatch");
        assert_eq!(achieved, brute_force(&items, capacity), "suboptimal selection");
    }
}

#[test]
fn everything_selected_when_total_fits() {
    let mut be = entry_with(&[(100, 1), (50, 0), (25, 9)]);
    let achieved = solve_knapsack(&mut be.send_buffer, 400);
    assert_eq!(achieved, 10);
    assert!(be.send_buffer.iter().all(|e| e.selected));
}

#[test]
fn approximation_never_overcommits() {
    let mut rng = StdRng::seed_from_u64(0xBEEF);
    for _ in 0..100 {
        let count = rng.gen_range(1..=12);
        let items: Vec<(usize, u32)> = (0..count)
            .map(|_| (rng.gen_range(1..=600), rng.gen_range(0..=50)))
            .collect();
        let capacity = rng.gen_range(64..=1400);
        let mut be = entry_with(&items);
        approximate_knapsack(&mut be.send_buffer, capacity);
        let selected_size: usize = be
            .send_buffer
            .iter()
            .filter(|e| e.selected)
            .map(|e| e.len)
            .sum();
        assert!(selected_size <= capacity);
    }
}
