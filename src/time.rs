use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction so the whole core can be driven deterministically
/// in tests.
///
/// `now_instant` feeds every interval computation (token buckets,
/// timeouts, scheduler gates); `now_unix` feeds wire timestamps, which
/// are seconds since the Unix epoch per the frame format.
pub trait TimeProvider: Send + Sync + Debug {
    fn now_instant(&self) -> Instant;
    fn now_unix(&self) -> u32;
}

/// The real clock.
#[derive(Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now_instant(&self) -> Instant {
        Instant::now()
    }

    fn now_unix(&self) -> u32 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0)
    }
}

/// A manual time provider for deterministic simulations.
#[derive(Debug)]
pub struct ManualTimeProvider {
    instant: RwLock<Instant>,
    unix: RwLock<u32>,
}

impl ManualTimeProvider {
    pub fn new(instant: Instant, unix: u32) -> Self {
        Self {
            instant: RwLock::new(instant),
            unix: RwLock::new(unix),
        }
    }

    pub fn set_time(&self, instant: Instant, unix: u32) {
        *self.instant.write().unwrap() = instant;
        *self.unix.write().unwrap() = unix;
    }

    pub fn advance(&self, duration: Duration) {
        *self.instant.write().unwrap() += duration;
        *self.unix.write().unwrap() += duration.as_secs() as u32;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now_instant(&self) -> Instant {
        *self.instant.read().unwrap()
    }

    fn now_unix(&self) -> u32 {
        *self.unix.read().unwrap()
    }
}
