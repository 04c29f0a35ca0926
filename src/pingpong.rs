use crate::identity::PeerId;
use crate::protocol::{Challenge, PingPongBody};
use std::time::Instant;
use tracing::debug;

/// Capacity of the ledger; the oldest slot is evicted when full.
pub const MAX_PING_PONG: usize = 64;

/// Deferred action resolved by the matching PONG.
pub type PingAction = Box<dyn FnOnce() + Send>;

struct PingEntry {
    receiver: PeerId,
    challenge: Challenge,
    sent_at: Instant,
    action: PingAction,
}

/// Fixed-size table mapping (peer, challenge) to a deferred action.
///
/// Populated when the core sends a PING, drained when the matching
/// PONG returns. Each slot fires at most once; unmatched slots are
/// simply overwritten by later pings.
pub struct PingLedger {
    slots: Vec<Option<PingEntry>>,
}

impl PingLedger {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_PING_PONG);
        slots.resize_with(MAX_PING_PONG, || None);
        Self { slots }
    }

    /// Registers a deferred action and returns the PING body to send.
    /// Evicts the oldest slot when the table is full.
    pub fn register(
        &mut self,
        receiver: PeerId,
        action: PingAction,
        now: Instant,
        rng: &mut dyn rand::RngCore,
    ) -> PingPongBody {
        let challenge = Challenge(rng.next_u32());
        let entry = PingEntry {
            receiver,
            challenge,
            sent_at: now,
            action,
        };
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                let oldest = self
                    .slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.as_ref().map(|e| e.sent_at))
                    .map(|(i, _)| i)
                    .unwrap_or(0);
                debug!("ping ledger full, evicting oldest slot {oldest}");
                oldest
            }
        };
        self.slots[slot] = Some(entry);
        PingPongBody {
            receiver,
            challenge,
        }
    }

    /// Resolves a PONG: if a slot matches (sender, challenge) its
    /// action runs exactly once and the slot is freed.
    pub fn pong_received(&mut self, sender: &PeerId, challenge: Challenge) -> bool {
        for slot in &mut self.slots {
            let matches = slot
                .as_ref()
                .is_some_and(|e| e.receiver == *sender && e.challenge == challenge);
            if matches {
                let entry = slot.take().expect("slot checked above");
                (entry.action)();
                return true;
            }
        }
        debug!("unmatched pong from {sender} (challenge {challenge})");
        false
    }

    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for PingLedger {
    fn default() -> Self {
        Self::new()
    }
}
