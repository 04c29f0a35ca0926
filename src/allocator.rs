use crate::entry::BufferEntry;
use crate::identity::PeerId;
use crate::protocol::{MAX_BUF_FACT, MIN_BPM_PER_PEER, min_sample_time};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Violations tolerated before a peer is blacklisted.
const MAX_VIOLATIONS: u32 = 10;
/// Per-peer under-allocation accepted when ending the distribution loop.
const RESIDUAL_PER_PEER: u64 = 100;

/// Side effects the caller must apply after a round: peers to punish
/// and peers whose connection should be shut down.
#[derive(Default)]
pub struct AllocationActions {
    pub blacklist: Vec<(PeerId, Duration)>,
    /// Too-many-peers policy: these keep `MIN_BPM_PER_PEER` but the
    /// connection is torn down.
    pub cull: Vec<PeerId>,
}

/// Periodic fair-share redistribution of inbound bandwidth credit.
///
/// Stateful only in the round timestamp; all per-peer numbers live in
/// the connection table rows.
pub struct InboundAllocator {
    last_round: Option<Instant>,
}

impl InboundAllocator {
    pub fn new() -> Self {
        Self { last_round: None }
    }

    /// Runs one allocation round over all UP entries.
    ///
    /// `capacity` is the connection-table size, `max_bpm` the total
    /// downstream budget, `download_load` the current utilisation in
    /// percent.
    pub fn run(
        &mut self,
        entries: &mut [&mut BufferEntry],
        capacity: usize,
        max_bpm: u64,
        download_load: u32,
        now: Instant,
        rng: &mut dyn rand::RngCore,
    ) -> AllocationActions {
        let mut actions = AllocationActions::default();

        // No sample data on the very first round.
        let Some(last_round) = self.last_round else {
            self.last_round = Some(now);
            for be in entries.iter_mut() {
                be.recently_received = 0;
            }
            return actions;
        };
        if entries.is_empty() {
            return actions;
        }

        let elapsed = now.saturating_duration_since(last_round);
        let early_run = elapsed < min_sample_time();
        // An early run with a healthy population would update limits
        // from unrepresentative samples; only a near-empty table is
        // rescheduled aggressively.
        if early_run && entries.len() > capacity / 16 {
            return actions;
        }
        let elapsed_ms = (elapsed.as_millis() as u64).max(1);

        // Traffic-preference shares, normalised to sum 1.
        let mut shares: Vec<f64> = entries
            .iter()
            .map(|be| be.current_connection_value.max(0.0))
            .collect();
        let share_sum: f64 = shares.iter().sum();
        if share_sum >= 0.00001 {
            for s in &mut shares {
                *s /= share_sum;
            }
        } else {
            let uniform = 1.0 / entries.len() as f64;
            shares.fill(uniform);
        }

        let mut min_con = (capacity / 2).min(entries.len()) as u64;
        let mut pool: u64 = if max_bpm > min_con * MIN_BPM_PER_PEER {
            max_bpm - min_con * MIN_BPM_PER_PEER
        } else {
            min_con = max_bpm / MIN_BPM_PER_PEER;
            0
        };
        if download_load > 100 {
            pool = pool * 100 / download_load as u64;
        }

        // Recent-activity profile, with violation detection.
        let active_count = entries.len();
        let mut alive: Vec<usize> = (0..entries.len()).collect();
        let mut adjusted = vec![0u64; entries.len()];
        alive.retain(|&u| {
            let be = &mut *entries[u];
            let mut rate = be.recently_received * 60_000 / elapsed_ms / 2;
            if !early_run
                && rate > 2 * MAX_BUF_FACT * be.max_transmitted_limit
                && rate > 2 * MAX_BUF_FACT * be.idealized_limit
            {
                be.violations += 1;
                be.recently_received = 0;
                if be.violations > MAX_VIOLATIONS {
                    info!(
                        "blacklisting {}: received {rate} bpm against limit {} bpm",
                        be.peer, be.max_transmitted_limit
                    );
                    // Penalty scales with the inverse table saturation.
                    let secs = 3600 * capacity as u64 / active_count.max(1) as u64;
                    actions
                        .blacklist
                        .push((be.peer, Duration::from_secs(secs.clamp(60, 86_400))));
                    return false;
                }
            } else if !early_run && rate < be.max_transmitted_limit / 2 && be.violations > 0 {
                be.violations -= 1;
            }
            rate = rate.max(MIN_BPM_PER_PEER);
            // Smooth toward the previous allocation.
            adjusted[u] = (be.idealized_limit * 3 + rate) / 4;
            true
        });

        // Iterative weighted distribution; the first pass caps each
        // peer at twice its recent utilisation, and holds an eighth of
        // the pool back for new connections.
        for &u in &alive {
            entries[u].idealized_limit = 0;
        }
        let mut first_round = true;
        let mut did_assign = true;
        while pool > alive.len() as u64 * RESIDUAL_PER_PEER && !alive.is_empty() && did_assign {
            did_assign = false;
            let mut decrement: i64 = 0;
            for &u in alive.iter() {
                let be = &mut *entries[u];
                if first_round && be.idealized_limit >= adjusted[u] * 2 {
                    continue;
                }
                let mut share = be
                    .idealized_limit
                    .saturating_add((shares[u] * pool as f64) as u64);
                if first_round {
                    share = share.min(adjusted[u] * 2);
                }
                if share < MIN_BPM_PER_PEER && min_con > 0 {
                    // Spend one of the reserved minimum slots.
                    share += MIN_BPM_PER_PEER;
                    decrement -= MIN_BPM_PER_PEER as i64;
                    min_con -= 1;
                }
                if share > be.idealized_limit {
                    decrement += (share - be.idealized_limit) as i64;
                    be.idealized_limit = share;
                    did_assign = true;
                }
            }
            if decrement < pool as i64 {
                pool = (pool as i64 - decrement).max(0) as u64;
            } else {
                pool = 0;
                break;
            }
            if !did_assign && !alive.is_empty() {
                // Nothing gained from shares; hand the rest to peers
                // in random order so low slots get no preference.
                let perm = permutation(alive.len(), rng);
                for &slot in &perm {
                    let u = alive[slot];
                    let be = &mut *entries[u];
                    if first_round && be.idealized_limit >= adjusted[u] * 2 {
                        continue;
                    }
                    let mut share = be.idealized_limit.saturating_add(pool);
                    if first_round {
                        share = share.min(adjusted[u] * 2);
                    }
                    if share > be.idealized_limit {
                        pool -= share - be.idealized_limit;
                        be.idealized_limit = share;
                    }
                }
            }
            if first_round {
                pool = pool * 7 / 8;
            }
            first_round = false;
        }

        // Whatever is left is split evenly, caps disregarded.
        if pool > 0 && !alive.is_empty() {
            let each = pool / alive.len() as u64;
            let perm = permutation(alive.len(), rng);
            for &slot in &perm {
                let be = &mut *entries[alive[slot]];
                be.idealized_limit = be.idealized_limit.saturating_add(each);
            }
        }

        // Random bonuses create churn and thus opportunities.
        if !alive.is_empty() {
            for _ in 0..min_con {
                let pick = alive[rng.gen_range(0..alive.len())];
                entries[pick].idealized_limit += MIN_BPM_PER_PEER;
            }
        }

        for &u in &alive {
            let be = &mut *entries[u];
            if elapsed_ms > 50 && rng.gen_range(0..=elapsed_ms) > 50 {
                be.current_connection_value *= 0.9;
            }
            let mut decay = be.idealized_limit * elapsed_ms / 60_000 / 2;
            if decay == 0 && rng.gen_range(0..=elapsed_ms) != 0 {
                decay = 1;
            }
            be.recently_received = be.recently_received.saturating_sub(decay);
        }

        // Too-many-peers policy: a floor allocation is still advertised
        // (zero would read as plaintext) but the connection goes away.
        for &u in &alive {
            let be = &mut *entries[u];
            if be.idealized_limit < MIN_BPM_PER_PEER {
                debug!(
                    "culling low-traffic connection {} ({} bpm)",
                    be.peer, be.idealized_limit
                );
                be.idealized_limit = MIN_BPM_PER_PEER;
                actions.cull.push(be.peer);
            }
        }

        self.last_round = Some(now);
        actions
    }
}

impl Default for InboundAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn permutation(len: usize, rng: &mut dyn rand::RngCore) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..len).collect();
    for j in (1..len).rev() {
        let k = rng.gen_range(0..=j);
        perm.swap(j, k);
    }
    perm
}
