use crate::identity::PeerId;
use crate::protocol::{FragmentBody, FragmentId};
use std::time::{Duration, Instant};
use tracing::debug;

/// Hash buckets for in-progress reassemblies.
const BUCKET_COUNT: usize = 16;
/// Incomplete reassemblies are discarded after this long.
pub const DEFRAG_TIMEOUT: Duration = Duration::from_secs(3 * 60);

/// Splits a message into fragments of at most `payload_mtu` bytes each,
/// tagged with a shared id. Caller guarantees `data.len() <= u16::MAX`.
pub fn split_message(id: FragmentId, payload_mtu: usize, data: &[u8]) -> Vec<FragmentBody> {
    debug_assert!(payload_mtu > 0);
    let total_len = data.len() as u16;
    data.chunks(payload_mtu)
        .enumerate()
        .map(|(i, chunk)| FragmentBody {
            id,
            total_len,
            offset: (i * payload_mtu) as u16,
            payload: chunk.to_vec(),
        })
        .collect()
}

/// One in-progress reassembly: fragments held in offset order.
struct Assembly {
    sender: PeerId,
    id: FragmentId,
    total_len: u16,
    deadline: Instant,
    /// Sorted by offset; overlap allowed, strict enclosure is not kept.
    fragments: Vec<FragmentBody>,
}

impl Assembly {
    fn end_of(frag: &FragmentBody) -> usize {
        frag.offset as usize + frag.payload.len()
    }

    /// Coverage merge: drop the new fragment if an existing one
    /// encloses it, drop existing fragments the new one encloses,
    /// insert in offset order.
    fn merge(&mut self, frag: FragmentBody) {
        let start = frag.offset as usize;
        let end = Self::end_of(&frag);

        if self
            .fragments
            .iter()
            .any(|f| (f.offset as usize) <= start && Self::end_of(f) >= end)
        {
            return;
        }
        self.fragments
            .retain(|f| !((f.offset as usize) >= start && Self::end_of(f) <= end));
        let at = self
            .fragments
            .partition_point(|f| f.offset < frag.offset);
        self.fragments.insert(at, frag);
    }

    /// If the fragments now cover `[0, total_len)` without gaps,
    /// assembles and returns the full message.
    fn try_complete(&self) -> Option<Vec<u8>> {
        let total = self.total_len as usize;
        let mut covered = 0usize;
        for frag in &self.fragments {
            if frag.offset as usize > covered {
                return None;
            }
            covered = covered.max(Self::end_of(frag));
        }
        if covered < total {
            return None;
        }
        let mut out = vec![0u8; total];
        for frag in &self.fragments {
            let start = frag.offset as usize;
            let end = Self::end_of(frag).min(total);
            out[start..end].copy_from_slice(&frag.payload[..end - start]);
        }
        Some(out)
    }
}

/// Reassembly state for fragments arriving below the transport MTU,
/// keyed by (sender, id) in a small chained hash table.
pub struct Defragmenter {
    buckets: Vec<Vec<Assembly>>,
}

impl Defragmenter {
    pub fn new() -> Self {
        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        buckets.resize_with(BUCKET_COUNT, Vec::new);
        Self { buckets }
    }

    fn bucket_of(sender: &PeerId) -> usize {
        (sender.first_word() as usize) % BUCKET_COUNT
    }

    /// Feeds one fragment in; returns the whole message once coverage
    /// is complete. A fragment whose `total_len` disagrees with an
    /// existing assembly of the same id is rejected.
    pub fn add_fragment(
        &mut self,
        sender: &PeerId,
        frag: FragmentBody,
        now: Instant,
    ) -> Option<Vec<u8>> {
        if frag.total_len == 0
            || frag.offset as usize + frag.payload.len() > frag.total_len as usize
        {
            debug!("dropping malformed fragment from {sender}");
            return None;
        }
        let bucket = &mut self.buckets[Self::bucket_of(sender)];

        let slot = bucket
            .iter_mut()
            .find(|a| a.sender == *sender && a.id == frag.id);
        let assembly = match slot {
            Some(assembly) => {
                if assembly.total_len != frag.total_len {
                    debug!(
                        "fragment length mismatch from {sender} (id {}): {} != {}",
                        frag.id, frag.total_len, assembly.total_len
                    );
                    return None;
                }
                assembly
            }
            None => {
                bucket.push(Assembly {
                    sender: *sender,
                    id: frag.id,
                    total_len: frag.total_len,
                    deadline: now + DEFRAG_TIMEOUT,
                    fragments: Vec::new(),
                });
                bucket.last_mut().expect("just pushed")
            }
        };

        assembly.merge(frag);
        let done = assembly.try_complete();
        if done.is_some() {
            let id = assembly.id;
            bucket.retain(|a| !(a.sender == *sender && a.id == id));
        }
        done
    }

    /// Discards assemblies whose deadline passed. Driven once per
    /// minute by the core's periodic task.
    pub fn purge(&mut self, now: Instant) {
        for bucket in &mut self.buckets {
            bucket.retain(|a| {
                let keep = a.deadline > now;
                if !keep {
                    debug!("expiring stale reassembly {} from {}", a.id, a.sender);
                }
                keep
            });
        }
    }

    pub fn pending(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }
}

impl Default for Defragmenter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(tag: u8) -> PeerId {
        PeerId::from_bytes([tag; 64])
    }

    #[test]
    fn out_of_order_arrival_reassembles() {
        let mut defrag = Defragmenter::new();
        let now = Instant::now();
        let sender = peer(1);
        let message: Vec<u8> = (0..32).collect();
        let frags = split_message(FragmentId(42), 16, &message);
        assert_eq!(frags.len(), 2);
        assert!(
            defrag
                .add_fragment(&sender, frags[1].clone(), now)
                .is_none()
        );
        let out = defrag.add_fragment(&sender, frags[0].clone(), now).unwrap();
        assert_eq!(out, message);
        assert_eq!(defrag.pending(), 0);
    }

    #[test]
    fn total_len_mismatch_rejected() {
        let mut defrag = Defragmenter::new();
        let now = Instant::now();
        let sender = peer(1);
        defrag.add_fragment(
            &sender,
            FragmentBody {
                id: FragmentId(7),
                total_len: 32,
                offset: 0,
                payload: vec![0; 16],
            },
            now,
        );
        // Same id, contradictory total length: must not merge.
        assert!(
            defrag
                .add_fragment(
                    &sender,
                    FragmentBody {
                        id: FragmentId(7),
                        total_len: 48,
                        offset: 16,
                        payload: vec![0; 32],
                    },
                    now,
                )
                .is_none()
        );
        assert_eq!(defrag.pending(), 1);
    }

    #[test]
    fn enclosed_fragments_are_dropped() {
        let mut defrag = Defragmenter::new();
        let now = Instant::now();
        let sender = peer(3);
        let message: Vec<u8> = (0..40).map(|i| i as u8).collect();
        // Small piece first, then a larger fragment enclosing it.
        defrag.add_fragment(
            &sender,
            FragmentBody {
                id: FragmentId(9),
                total_len: 40,
                offset: 8,
                payload: message[8..16].to_vec(),
            },
            now,
        );
        defrag.add_fragment(
            &sender,
            FragmentBody {
                id: FragmentId(9),
                total_len: 40,
                offset: 0,
                payload: message[0..24].to_vec(),
            },
            now,
        );
        let out = defrag
            .add_fragment(
                &sender,
                FragmentBody {
                    id: FragmentId(9),
                    total_len: 40,
                    offset: 24,
                    payload: message[24..40].to_vec(),
                },
                now,
            )
            .unwrap();
        assert_eq!(out, message);
    }

    #[test]
    fn purge_discards_timed_out_assembly() {
        let mut defrag = Defragmenter::new();
        let now = Instant::now();
        let sender = peer(2);
        defrag.add_fragment(
            &sender,
            FragmentBody {
                id: FragmentId(1),
                total_len: 32,
                offset: 16,
                payload: vec![0; 16],
            },
            now,
        );
        defrag.purge(now + DEFRAG_TIMEOUT + Duration::from_secs(1));
        assert_eq!(defrag.pending(), 0);
        // The late second half now starts a fresh (incomplete) assembly.
        assert!(
            defrag
                .add_fragment(
                    &sender,
                    FragmentBody {
                        id: FragmentId(1),
                        total_len: 32,
                        offset: 0,
                        payload: vec![0; 16],
                    },
                    now + DEFRAG_TIMEOUT + Duration::from_secs(2),
                )
                .is_none()
        );
    }
}
