use crate::core::CoreInner;
use crate::entry::{Placement, Status};
use crate::error::CoreResult;
use crate::hello::Hello;
use crate::identity::PeerId;
use crate::protocol::{MessageKind, PingPongBody, build_part};
use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cadence of the two advertisement tasks.
pub const BROADCAST_PERIOD: Duration = Duration::from_secs(2 * 60);
pub const FORWARD_PERIOD: Duration = Duration::from_secs(4 * 60);

/// Periodic advertisement bookkeeping plus the budget that keeps HELLO
/// verification traffic around one percent of downstream bandwidth.
pub struct AdvertState {
    last_broadcast: Instant,
    last_forward: Instant,
    verify_budget: i64,
    last_refill: Instant,
    verify_bpm: u64,
}

impl AdvertState {
    pub fn new(now: Instant, max_bpm_down: u64) -> Self {
        let verify_bpm = (max_bpm_down / 100).max(1);
        Self {
            last_broadcast: now,
            last_forward: now,
            verify_budget: verify_bpm as i64,
            last_refill: now,
            verify_bpm,
        }
    }

    /// Token bucket for verification traffic; capped at one minute of
    /// budget.
    fn take_verify_budget(&mut self, cost: usize, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let refill = self.verify_bpm as u128 * elapsed.as_millis() / 60_000;
        if refill > 0 {
            self.verify_budget =
                (self.verify_budget + refill as i64).min(self.verify_bpm as i64);
            self.last_refill = now;
        }
        if self.verify_budget < cost as i64 {
            return false;
        }
        self.verify_budget -= cost as i64;
        true
    }
}

/// Runs whichever advertisement task is due.
pub(crate) fn drive(inner: &CoreInner, now: Instant) {
    let (do_broadcast, do_forward) = {
        let mut state = inner.advert.lock();
        let mut broadcast = false;
        let mut forward = false;
        if !inner.config.disable_advertisements
            && now.saturating_duration_since(state.last_broadcast) >= BROADCAST_PERIOD
        {
            state.last_broadcast = now;
            broadcast = true;
        }
        if inner.config.hello_exchange
            && now.saturating_duration_since(state.last_forward) >= FORWARD_PERIOD
        {
            state.last_forward = now;
            forward = true;
        }
        (broadcast, forward)
    };
    if do_broadcast {
        broadcast_hellos(inner);
    }
    if do_forward {
        forward_hellos(inner);
    }
}

/// Announces our own HELLOs: to each peer known on a transport with
/// probability 1/known, directly when connected, otherwise through a
/// one-shot connect-send-disconnect.
pub(crate) fn broadcast_hellos(inner: &CoreInner) {
    let now_unix = inner.time.now_unix();
    let ttl = inner.config.hello_ttl();
    let hellos = inner
        .transports
        .advertisements(inner.identity.as_ref(), now_unix + ttl.as_secs() as u32);

    let connected: Vec<PeerId> = {
        let table = inner.table.lock();
        table
            .iter()
            .filter(|e| e.status == Status::Up)
            .map(|e| e.peer)
            .collect()
    };

    for hello in hellos {
        let peers = inner.known_hosts.lock().peers_on(hello.transport);
        if peers.is_empty() {
            continue;
        }
        let count = peers.len();
        let part = build_part(MessageKind::HELLO, &hello.encode());
        for peer in peers {
            let chosen = inner.rng.lock().gen_range(0..count) == 0;
            if !chosen {
                continue;
            }
            if connected.contains(&peer) {
                let _ = inner.enqueue_part(
                    &peer,
                    part.clone(),
                    0,
                    BROADCAST_PERIOD,
                    Placement::None,
                );
                continue;
            }
            // One-shot delivery to a disconnected peer.
            let target = inner
                .known_hosts
                .lock()
                .get(&peer, hello.transport)
                .cloned();
            if let Some(target) = target {
                if let Ok(session) = inner.transports.connect(&target) {
                    let _ = inner.send_plaintext(session, &part);
                    inner.transports.disconnect(session);
                }
            }
        }
    }
}

/// Re-forwards known HELLOs to direct neighbours with bounded
/// amplification: probability 1/(known * connected) each.
pub(crate) fn forward_hellos(inner: &CoreInner) {
    let now_unix = inner.time.now_unix();
    let (known, known_count) = {
        let store = inner.known_hosts.lock();
        (store.iter().cloned().collect::<Vec<_>>(), store.len())
    };
    let connected: Vec<PeerId> = {
        let table = inner.table.lock();
        table
            .iter()
            .filter(|e| e.status == Status::Up)
            .map(|e| e.peer)
            .collect()
    };
    if known_count == 0 || connected.is_empty() {
        return;
    }
    let odds = known_count * connected.len();

    for hello in known {
        if hello.is_expired(now_unix) {
            continue;
        }
        let nat = inner
            .transports
            .get(hello.transport)
            .is_some_and(|d| d.is_nat());
        if nat {
            continue;
        }
        if inner.rng.lock().gen_range(0..odds) != 0 {
            continue;
        }
        let part = build_part(MessageKind::HELLO, &hello.encode());
        for peer in &connected {
            let _ = inner.enqueue_part(peer, part.clone(), 0, FORWARD_PERIOD, Placement::None);
        }
    }
}

/// Incoming HELLO processing: validation, duplicate trust, private
/// network policy, then the PING verification dance.
pub(crate) fn handle_hello(inner: &CoreInner, body: &[u8]) -> CoreResult<()> {
    let now = inner.time.now_instant();
    let now_unix = inner.time.now_unix();
    let hello = match Hello::decode(body) {
        Ok(hello) => hello,
        Err(e) => {
            warn!("discarding malformed HELLO: {e}");
            return Ok(());
        }
    };
    if let Err(e) = hello.validate(inner.identity.as_ref(), now_unix) {
        warn!("discarding invalid HELLO from {}: {e}", hello.sender);
        return Ok(());
    }
    if hello.sender == inner.identity.own_id() {
        return Ok(());
    }
    // The key itself is authentic regardless of the address dance.
    inner
        .peer_keys
        .lock()
        .insert(hello.sender, hello.public_key);

    {
        let mut known = inner.known_hosts.lock();
        if known.is_known(&hello) {
            // Same address already verified earlier; just refresh.
            known.put(hello);
            return Ok(());
        }
        if inner.config.private_network && !known.contains_peer(&hello.sender) {
            debug!("private network: rejecting HELLO from {}", hello.sender);
            return Ok(());
        }
    }

    let Some(driver) = inner.transports.get(hello.transport) else {
        debug!(
            "no driver for transport {} advertised by {}",
            hello.transport, hello.sender
        );
        return Ok(());
    };
    if !driver.verify_advertisement(&hello) {
        debug!("driver rejected HELLO address from {}", hello.sender);
        return Ok(());
    }

    let own_hello = inner.own_hello_for(hello.transport);
    let own_part = own_hello
        .as_ref()
        .map(|h| build_part(MessageKind::HELLO, &h.encode()))
        .unwrap_or_default();
    let cost = hello.encode().len() + own_part.len() + PingPongBody::LEN;
    if !inner.advert.lock().take_verify_budget(cost, now) {
        debug!("verification budget exhausted, deferring HELLO from {}", hello.sender);
        return Ok(());
    }

    // Verification dance: challenge the advertised address; the HELLO
    // is adopted only if the matching PONG ever returns.
    let Ok(session) = driver.connect(&hello) else {
        debug!("cannot reach advertised address of {}", hello.sender);
        return Ok(());
    };
    let ping = {
        let mut ledger = inner.pingpong.lock();
        let mut rng = inner.rng.lock();
        let weak = inner.weak();
        let hello = hello.clone();
        ledger.register(
            hello.sender,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    info!("verified HELLO address of {}", hello.sender);
                    inner.known_hosts.lock().put(hello);
                }
            }),
            now,
            &mut *rng,
        )
    };
    let mut parts = own_part;
    parts.extend_from_slice(&build_part(MessageKind::PING, &ping.encode()));
    let _ = inner.send_plaintext(session, &parts);
    inner.transports.disconnect(session);
    Ok(())
}
