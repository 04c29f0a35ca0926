use crate::entry::{BufferEntry, Status};
use crate::identity::PeerId;
use crate::protocol::MIN_BPM_PER_PEER;
use std::time::Instant;
use tracing::debug;

/// Hash-indexed table of connection rows, one per peer.
///
/// Buckets are selected by the low bits of the identity's first word;
/// entries sharing a bucket chain in insertion order. The bucket count
/// scales with the configured downstream bandwidth and is rounded up
/// to a power of two so the mask stays cheap.
pub struct ConnectionTable {
    buckets: Vec<Vec<BufferEntry>>,
    mask: u64,
}

fn bucket_count_for(max_bpm: u64) -> usize {
    let target = (max_bpm / (4 * MIN_BPM_PER_PEER)).clamp(4, 256) as usize;
    target.next_power_of_two()
}

impl ConnectionTable {
    pub fn new(max_bpm: u64) -> Self {
        let count = bucket_count_for(max_bpm);
        let mut buckets = Vec::with_capacity(count);
        buckets.resize_with(count, Vec::new);
        debug!("connection table sized to {count} buckets");
        Self {
            buckets,
            mask: count as u64 - 1,
        }
    }

    /// Capacity as used by the fair-share allocator's `minCon`.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_of(&self, peer: &PeerId) -> usize {
        (peer.first_word() & self.mask) as usize
    }

    pub fn lookup(&self, peer: &PeerId) -> Option<&BufferEntry> {
        self.buckets[self.bucket_of(peer)]
            .iter()
            .find(|e| e.peer == *peer)
    }

    pub fn lookup_mut(&mut self, peer: &PeerId) -> Option<&mut BufferEntry> {
        let bucket = self.bucket_of(peer);
        self.buckets[bucket].iter_mut().find(|e| e.peer == *peer)
    }

    /// Returns the row for `peer`, creating it in DOWN if absent.
    pub fn add_host(&mut self, peer: PeerId, now: Instant) -> &mut BufferEntry {
        let bucket = self.bucket_of(&peer);
        let chain = &mut self.buckets[bucket];
        if let Some(at) = chain.iter().position(|e| e.peer == peer) {
            return &mut chain[at];
        }
        chain.push(BufferEntry::new(peer, now));
        chain.last_mut().expect("just pushed")
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<BufferEntry> {
        let bucket = self.bucket_of(peer);
        let chain = &mut self.buckets[bucket];
        let at = chain.iter().position(|e| e.peer == *peer)?;
        Some(chain.remove(at))
    }

    /// Re-buckets every row after a bandwidth reconfiguration.
    pub fn resize(&mut self, max_bpm: u64) {
        let count = bucket_count_for(max_bpm);
        if count == self.buckets.len() {
            return;
        }
        let old = std::mem::take(&mut self.buckets);
        self.buckets.resize_with(count, Vec::new);
        self.mask = count as u64 - 1;
        for entry in old.into_iter().flatten() {
            let bucket = self.bucket_of(&entry.peer);
            self.buckets[bucket].push(entry);
        }
        debug!("connection table rehashed to {count} buckets");
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferEntry> {
        self.buckets.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BufferEntry> {
        self.buckets.iter_mut().flatten()
    }

    /// All rows currently in UP.
    pub fn up_entries_mut(&mut self) -> Vec<&mut BufferEntry> {
        self.iter_mut()
            .filter(|e| e.status == Status::Up)
            .collect()
    }

    pub fn up_count(&self) -> usize {
        self.iter().filter(|e| e.status == Status::Up).count()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops rows that sat in DOWN with nothing queued; keeps the
    /// table from accumulating one row per peer ever seen.
    pub fn sweep_down(&mut self) {
        for bucket in &mut self.buckets {
            bucket.retain(|e| e.status != Status::Down || !e.send_buffer.is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(tag: u8) -> PeerId {
        let mut bytes = [0u8; 64];
        bytes[7] = tag; // low bits of the first word
        PeerId::from_bytes(bytes)
    }

    #[test]
    fn sizing_clamps_and_rounds() {
        assert_eq!(ConnectionTable::new(0).capacity(), 4);
        assert_eq!(ConnectionTable::new(MIN_BPM_PER_PEER * 4 * 100).capacity(), 128);
        assert_eq!(ConnectionTable::new(u64::MAX / 2).capacity(), 256);
    }

    #[test]
    fn add_lookup_remove_roundtrip() {
        let mut table = ConnectionTable::new(0);
        let now = Instant::now();
        // Several peers landing in the same bucket chain.
        for tag in 0..8 {
            table.add_host(peer(tag * 4), now);
        }
        assert_eq!(table.len(), 8);
        assert!(table.lookup(&peer(4)).is_some());
        assert!(table.lookup(&peer(99)).is_none());
        assert!(table.remove(&peer(4)).is_some());
        assert!(table.lookup(&peer(4)).is_none());
    }

    #[test]
    fn resize_rehashes_all_entries() {
        let mut table = ConnectionTable::new(0);
        let now = Instant::now();
        for tag in 0..16 {
            table.add_host(peer(tag), now);
        }
        table.resize(MIN_BPM_PER_PEER * 4 * 64);
        assert_eq!(table.capacity(), 64);
        for tag in 0..16 {
            assert!(table.lookup(&peer(tag)).is_some());
        }
    }
}
