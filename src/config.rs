use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Daemon configuration consumed by the connection core.
///
/// Field names mirror the daemon's configuration keys
/// (`LOAD/MAXNETDOWNBPSTOTAL`, `NETWORK/DISABLE-ADVERTISEMENTS`, ...);
/// the outer configuration loader maps sections onto this struct.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Total downstream budget, bytes per second.
    pub max_net_down_bps: u64,
    /// Total upstream budget, bytes per second.
    pub max_net_up_bps: u64,
    /// Suppress the periodic HELLO broadcast.
    pub disable_advertisements: bool,
    /// Forward other peers' HELLOs to connected neighbours.
    pub hello_exchange: bool,
    /// Lifetime of our own HELLOs, minutes (capped at ten days).
    pub hello_expires_minutes: u32,
    /// Fill spare frame space with random noise.
    pub experimental_padding: bool,
    /// Reject HELLOs from peers we have never seen before.
    pub private_network: bool,
    /// Transport driver names to load, in preference order.
    pub transports: Vec<String>,
    pub http_proxy: Option<String>,
    pub http_proxy_port: Option<u16>,
    /// Daemon home for the hostkey, known hosts and trust counters.
    /// None keeps everything in memory.
    pub home: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_net_down_bps: 50_000,
            max_net_up_bps: 50_000,
            disable_advertisements: false,
            hello_exchange: true,
            hello_expires_minutes: 24 * 60,
            experimental_padding: true,
            private_network: false,
            transports: vec!["udp".into(), "tcp".into()],
            http_proxy: None,
            http_proxy_port: None,
            home: None,
        }
    }
}

impl Config {
    /// Downstream budget in the bytes-per-minute unit all bandwidth
    /// accounting uses.
    pub fn max_bpm_down(&self) -> u64 {
        self.max_net_down_bps * 60
    }

    pub fn max_bpm_up(&self) -> u64 {
        self.max_net_up_bps * 60
    }

    pub fn hello_ttl(&self) -> Duration {
        Duration::from_secs(self.hello_expires_minutes as u64 * 60)
            .min(crate::hello::MAX_HELLO_AGE)
    }

    pub fn known_hosts_dir(&self) -> Option<PathBuf> {
        self.home.as_ref().map(|h| h.join("hosts"))
    }
}
