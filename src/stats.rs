use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide traffic counters, cheap enough to bump from any thread.
#[derive(Debug, Default)]
pub struct CoreStats {
    /// Bytes encrypted into outbound frames.
    encrypted: AtomicU64,
    /// Bytes decrypted from inbound frames.
    decrypted: AtomicU64,
    /// Frames handed to transports.
    transmitted_frames: AtomicU64,
    transmitted_bytes: AtomicU64,
    received_bytes: AtomicU64,
    /// Messages dropped by queue overflow or expiry.
    messages_dropped: AtomicU64,
    bytes_dropped: AtomicU64,
    /// Inbound datagrams dropped because the handoff queue was full.
    inbound_dropped: AtomicU64,
    /// Noise padding bytes sent.
    noise_sent: AtomicU64,
    /// Send credit lost to window overflow.
    lost_send_credit: AtomicU64,
    /// Frames rejected by the replay/sequence gate.
    replays_rejected: AtomicU64,
}

impl CoreStats {
    pub fn add_encrypted(&self, n: u64) {
        self.encrypted.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_decrypted(&self, n: u64) {
        self.decrypted.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_transmitted(&self, bytes: u64) {
        self.transmitted_frames.fetch_add(1, Ordering::Relaxed);
        self.transmitted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
    pub fn add_received(&self, bytes: u64) {
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
    pub fn add_dropped(&self, bytes: u64) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
        self.bytes_dropped.fetch_add(bytes, Ordering::Relaxed);
    }
    pub fn add_inbound_dropped(&self) {
        self.inbound_dropped.fetch_add(1, Ordering::Relaxed);
    }
    pub fn add_noise(&self, n: u64) {
        self.noise_sent.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_lost_send_credit(&self, n: u64) {
        self.lost_send_credit.fetch_add(n, Ordering::Relaxed);
    }
    pub fn add_replay_rejected(&self) {
        self.replays_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transmitted_frames(&self) -> u64 {
        self.transmitted_frames.load(Ordering::Relaxed)
    }
    pub fn transmitted_bytes(&self) -> u64 {
        self.transmitted_bytes.load(Ordering::Relaxed)
    }
    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }
    pub fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }
    pub fn inbound_dropped(&self) -> u64 {
        self.inbound_dropped.load(Ordering::Relaxed)
    }
    pub fn noise_sent(&self) -> u64 {
        self.noise_sent.load(Ordering::Relaxed)
    }
    pub fn lost_send_credit(&self) -> u64 {
        self.lost_send_credit.load(Ordering::Relaxed)
    }
    pub fn replays_rejected(&self) -> u64 {
        self.replays_rejected.load(Ordering::Relaxed)
    }
}
