use crate::crypto::SessionKey;
use crate::identity::PeerId;
use crate::protocol::{
    EXPECTED_MTU, HANDSHAKE_TIMEOUT, INACTIVITY_TIMEOUT, MAX_BUF_FACT, MAX_SEND_BUFFER_SIZE,
    MIN_BPM_PER_PEER, SEND_EXPIRY,
};
use crate::stats::CoreStats;
use crate::transport::TransportSession;
use std::time::Instant;
use tracing::debug;

/// Session state machine of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Down,
    /// We sent our session key, nothing confirmed yet.
    KeySent,
    /// We hold the peer's key (and have answered with ours).
    KeyReceived,
    Up,
}

/// Placement constraint of a queued message within its frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Placement {
    #[default]
    None,
    Head,
    Tail,
}

/// Message body: either ready bytes or a builder invoked at assembly
/// time. Exactly one of the two is ever active.
pub enum SendBody {
    Ready(Vec<u8>),
    /// Builder fills the provided buffer; false aborts and drops the entry.
    Deferred(Box<dyn FnOnce(&mut [u8]) -> bool + Send>),
}

/// Unit of work queued for outbound assembly: one complete part
/// (header plus body).
pub struct SendEntry {
    /// Bytes the part will occupy in the frame.
    pub len: usize,
    pub placement: Placement,
    pub priority: u32,
    /// Absolute deadline; entries linger `SEND_EXPIRY` past it.
    pub deadline: Instant,
    pub body: SendBody,
    /// Transient knapsack selection mark.
    pub selected: bool,
}

impl SendEntry {
    pub fn ready(
        bytes: Vec<u8>,
        priority: u32,
        deadline: Instant,
        placement: Placement,
    ) -> Self {
        Self {
            len: bytes.len(),
            placement,
            priority,
            deadline,
            body: SendBody::Ready(bytes),
            selected: false,
        }
    }

    pub fn deferred(
        len: usize,
        build: Box<dyn FnOnce(&mut [u8]) -> bool + Send>,
        priority: u32,
        deadline: Instant,
        placement: Placement,
    ) -> Self {
        Self {
            len,
            placement,
            priority,
            deadline,
            body: SendBody::Deferred(build),
            selected: false,
        }
    }

    /// Scheduling weight used to keep the queue sorted for the greedy
    /// paths: priority per byte.
    fn weight(&self) -> f64 {
        self.priority as f64 / self.len.max(1) as f64
    }
}

/// Connection-table row: all per-peer state of one session.
pub struct BufferEntry {
    pub peer: PeerId,
    pub tsession: Option<TransportSession>,
    /// 0 for streaming transports, else the datagram size.
    pub mtu: u16,
    pub status: Status,
    pub skey_local: Option<SessionKey>,
    pub skey_local_created: u32,
    pub skey_remote: Option<SessionKey>,
    pub skey_remote_created: u32,
    /// Last confirmed activity (decrypted traffic or matching PONG).
    pub last_alive: Instant,
    /// When `status` last changed, for the handshake timeout.
    pub last_status_change: Instant,
    pub last_seq_recv: u32,
    /// History bits for the 32 sequence numbers below `last_seq_recv`.
    pub recv_bitmap: u32,
    pub last_seq_send: u32,
    /// Pending parts, kept sorted by descending priority/length.
    pub send_buffer: Vec<SendEntry>,
    /// Byte credit toward this peer; may go negative when an
    /// EXTREME-priority frame is forced out.
    pub available_send_window: i64,
    pub last_bps_update: Instant,
    /// Cap the peer asked us to honor (bytes per minute).
    pub max_bpm: u64,
    pub last_send_attempt: Option<Instant>,
    /// Bytes received since the last allocation round.
    pub recently_received: u64,
    /// Application preference score; decays over time.
    pub current_connection_value: f64,
    /// Inbound allocation granted by the fair-share round.
    pub idealized_limit: u64,
    /// Largest limit we actually advertised, aged toward `idealized_limit`.
    pub max_transmitted_limit: u64,
    pub violations: u32,
    /// Re-entrancy guard: set while a thread assembles or emits a frame.
    pub in_send_buffer: bool,
}

impl BufferEntry {
    pub fn new(peer: PeerId, now: Instant) -> Self {
        Self {
            peer,
            tsession: None,
            mtu: 0,
            status: Status::Down,
            skey_local: None,
            skey_local_created: 0,
            skey_remote: None,
            skey_remote_created: 0,
            last_alive: now,
            last_status_change: now,
            last_seq_recv: 0,
            recv_bitmap: 0,
            // Sequence 0 marks plaintext frames, so encrypted traffic
            // starts at 1.
            last_seq_send: 1,
            send_buffer: Vec::new(),
            available_send_window: MIN_BPM_PER_PEER as i64,
            last_bps_update: now,
            max_bpm: MIN_BPM_PER_PEER,
            last_send_attempt: None,
            recently_received: 0,
            current_connection_value: 0.0,
            idealized_limit: MIN_BPM_PER_PEER,
            max_transmitted_limit: MIN_BPM_PER_PEER,
            violations: 0,
            in_send_buffer: false,
        }
    }

    pub fn set_status(&mut self, status: Status, now: Instant) {
        if self.status != status {
            debug!("{}: {:?} -> {:?}", self.peer, self.status, status);
            self.status = status;
            self.last_status_change = now;
        }
    }

    /// Token-bucket refill of the send window. Increments below 100
    /// bytes are deferred to avoid rounding loss; overflow past
    /// `max_bpm * MAX_BUF_FACT` is reported as lost send credit.
    pub fn refill_window(&mut self, now: Instant, stats: &CoreStats) {
        let elapsed = now.saturating_duration_since(self.last_bps_update);
        let increment = (self.max_bpm.max(1) as u128 * elapsed.as_millis()) / 60_000;
        if increment < 100 {
            return;
        }
        self.available_send_window = self
            .available_send_window
            .saturating_add(increment as i64);
        let limit = (self.max_bpm * MAX_BUF_FACT) as i64;
        if self.available_send_window > limit {
            stats.add_lost_send_credit((self.available_send_window - limit) as u64);
            self.available_send_window = limit;
        }
        self.last_bps_update = now;
    }

    /// Clamps the window after the peer lowered its advertised cap.
    pub fn clamp_window(&mut self, now: Instant, stats: &CoreStats) {
        let limit = (self.max_bpm * MAX_BUF_FACT) as i64;
        if self.available_send_window > limit {
            stats.add_lost_send_credit((self.available_send_window - limit) as u64);
            self.available_send_window = limit;
            self.last_bps_update = now;
        }
    }

    /// Replay and ordering gate. Returns whether the sequence number
    /// is acceptable and records it in the history window.
    pub fn check_sequence(&mut self, sequence: u32) -> bool {
        if sequence > self.last_seq_recv {
            let shift = sequence - self.last_seq_recv;
            self.recv_bitmap = if shift >= 32 {
                0
            } else {
                self.recv_bitmap << shift
            };
            self.last_seq_recv = sequence;
            return true;
        }
        let age = self.last_seq_recv - sequence;
        if age == 0 || age > 32 {
            return false;
        }
        let bit = 1u32 << (age - 1);
        if self.recv_bitmap & bit != 0 {
            return false;
        }
        self.recv_bitmap |= bit;
        true
    }

    /// Inserts a message keeping the queue ordered by descending
    /// priority per byte, as the greedy selection paths assume.
    pub fn enqueue(&mut self, entry: SendEntry) {
        let at = self
            .send_buffer
            .partition_point(|e| e.weight() >= entry.weight());
        self.send_buffer.insert(at, entry);
    }

    pub fn queued_bytes(&self) -> usize {
        self.send_buffer.iter().map(|e| e.len).sum()
    }

    /// Expires entries past their deadline plus `SEND_EXPIRY`, and
    /// everything beyond a byte cap derived from the peer's bpm
    /// (stretched while the CPU is idle).
    pub fn expire_send_buffer(
        &mut self,
        now: Instant,
        cpu_load: u32,
        max_bpm_up: u64,
        stats: &CoreStats,
    ) {
        self.last_send_attempt = Some(now);
        let mut msg_cap = self.max_bpm.clamp(EXPECTED_MTU as u64, max_bpm_up.max(EXPECTED_MTU as u64));
        if cpu_load < 50 {
            msg_cap += (MAX_SEND_BUFFER_SIZE as u64 - EXPECTED_MTU as u64)
                / cpu_load.max(1) as u64;
        }
        let mut used: u64 = 0;
        self.send_buffer.retain(|entry| {
            let hard_expired =
                now.saturating_duration_since(entry.deadline) > SEND_EXPIRY;
            if hard_expired || used > msg_cap {
                stats.add_dropped(entry.len as u64);
                false
            } else {
                used += entry.len as u64;
                true
            }
        });
    }

    /// Session keys are zeroed and all per-session accounting reset;
    /// the entry survives in DOWN so blacklist-independent state
    /// (bandwidth cap learning) restarts cleanly on reconnect.
    pub fn shutdown(&mut self, now: Instant) {
        if let Some(key) = &mut self.skey_local {
            key.zeroize();
        }
        if let Some(key) = &mut self.skey_remote {
            key.zeroize();
        }
        self.skey_local = None;
        self.skey_remote = None;
        self.skey_local_created = 0;
        self.skey_remote_created = 0;
        self.set_status(Status::Down, now);
        self.send_buffer.clear();
        self.last_seq_recv = 0;
        self.recv_bitmap = 0;
        self.last_seq_send = 1;
        self.violations = 0;
        self.tsession = None;
    }

    /// Liveness policy: UP entries die after the inactivity timeout,
    /// handshakes after the (shorter) handshake timeout.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        match self.status {
            Status::Down => false,
            Status::Up => now.saturating_duration_since(self.last_alive) > INACTIVITY_TIMEOUT,
            Status::KeySent | Status::KeyReceived => {
                now.saturating_duration_since(self.last_status_change) > HANDSHAKE_TIMEOUT
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry() -> BufferEntry {
        BufferEntry::new(PeerId::from_bytes([1; 64]), Instant::now())
    }

    #[test]
    fn sequence_window_tracks_history() {
        let mut be = entry();
        be.last_seq_recv = 100;
        be.recv_bitmap = 0;
        assert!(be.check_sequence(99));
        assert!(!be.check_sequence(99));
        assert!(!be.check_sequence(50));
        assert!(be.check_sequence(101));
        // After the shift, 99's bit is history position 2.
        assert_eq!(be.recv_bitmap & 0b10, 0b10);
        assert!(be.check_sequence(100));
    }

    #[test]
    fn window_refill_defers_small_increments() {
        let mut be = entry();
        let stats = CoreStats::default();
        be.max_bpm = 6000; // 100 bytes per second
        be.available_send_window = 0;
        let start = be.last_bps_update;
        be.refill_window(start + Duration::from_millis(500), &stats);
        assert_eq!(be.available_send_window, 0); // below 100-byte floor
        be.refill_window(start + Duration::from_secs(2), &stats);
        assert_eq!(be.available_send_window, 200);
    }

    #[test]
    fn window_refill_caps_and_counts_overflow() {
        let mut be = entry();
        let stats = CoreStats::default();
        be.max_bpm = 600;
        be.available_send_window = 0;
        let start = be.last_bps_update;
        be.refill_window(start + Duration::from_secs(600), &stats);
        assert_eq!(be.available_send_window, (600 * MAX_BUF_FACT) as i64);
        assert!(stats.lost_send_credit() > 0);
    }

    #[test]
    fn enqueue_keeps_priority_per_byte_order(){
        let mut be = entry();
        let now = Instant::now();
        be.enqueue(SendEntry::ready(vec![0; 100], 10, now, Placement::None));
        be.enqueue(SendEntry::ready(vec![0; 10], 10, now, Placement::None));
        be.enqueue(SendEntry::ready(vec![0; 50], 1, now, Placement::None));
        let weights: Vec<usize> = be.send_buffer.iter().map(|e| e.len).collect();
        assert_eq!(weights, vec![10, 100, 50]);
    }
}
