//! # Veil Core
//!
//! The peer-to-peer connection core of the veil overlay daemon: it
//! maintains authenticated, encrypted, bandwidth-scheduled sessions
//! with remote peers over pluggable transports, multiplexes
//! application traffic across those sessions, and fairly divides
//! inbound bandwidth among competing peers.
//!
//! ## Architecture
//!
//! - **Sessions**: a hash-indexed connection table of per-peer rows,
//!   each driving a DOWN / KEY_SENT / KEY_RECEIVED / UP state machine.
//! - **Outbound**: a priority-weighted 0/1-knapsack selects queued
//!   messages into one frame per tick; padding and noise fill the
//!   remainder before sealing.
//! - **Inbound**: a bounded handoff queue feeds a small worker pool
//!   that decrypts, replay-checks and demultiplexes frames to
//!   registered handler chains.
//! - **Fairness**: a periodic allocator redistributes downstream
//!   bandwidth credit proportionally to per-peer preference scores.
//! - **Gossip**: signed HELLO advertisements are broadcast, verified
//!   by PING challenge and re-forwarded with bounded amplification.

pub mod advert;
pub mod allocator;
pub mod config;
pub mod core;
pub mod crypto;
pub mod entry;
pub mod error;
pub mod flat_map;
pub mod fragment;
pub mod handler;
pub mod hello;
pub mod identity;
pub mod inbound;
pub mod pingpong;
pub mod protocol;
pub mod scheduler;
pub mod stats;
pub mod table;
pub mod time;
pub mod transport;

pub use config::Config;
pub use core::Core;
pub use crypto::SessionKey;
pub use error::{CoreError, CoreResult};
pub use hello::Hello;
pub use identity::{Identity, NodeIdentity, PeerId};
pub use protocol::MessageKind;
pub use stats::CoreStats;
pub use time::{ManualTimeProvider, SystemTimeProvider, TimeProvider};
pub use transport::{MemoryHub, MemoryTransport, Transport, TransportSession};
