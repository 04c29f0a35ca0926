use crate::advert::{self, AdvertState};
use crate::allocator::InboundAllocator;
use crate::config::Config;
use crate::crypto::SessionKey;
use crate::entry::{BufferEntry, Placement, SendBody, SendEntry, Status};
use crate::error::{CoreError, CoreResult};
use crate::fragment::{self, Defragmenter};
use crate::handler::{
    HandlerId, HandlerRegistry, PaddingCallback, PartHandler, PlaintextHandler, SendObserver,
};
use crate::hello::{Hello, KnownHosts};
use crate::identity::{Identity, PeerId};
use crate::inbound::{self, HeaderOutcome, InboundQueue, Packet, QueueItem, THREAD_COUNT};
use crate::pingpong::PingLedger;
use crate::protocol::{
    ADMIN_PRIORITY, EXTREME_PRIORITY, FragmentBody, FragmentId, HangupBody, INACTIVITY_TIMEOUT,
    MAX_SEND_BUFFER_SIZE, MessageKind, PACKET_HEADER_LEN, PART_HEADER_LEN, PingPongBody,
    SetKeyBody, TARGET_MSG_SID, build_part,
};
use crate::scheduler::{self, AssemblyContext, LoadEstimate, PlanOutcome};
use crate::stats::CoreStats;
use crate::table::ConnectionTable;
use crate::time::TimeProvider;
use crate::transport::{Multiplexer, SendOutcome, Transport, TransportSession};
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cadence of the periodic driver thread.
const CRON_INTERVAL: Duration = Duration::from_millis(100);
/// How often the fragment buckets are purged.
const DEFRAG_PURGE_INTERVAL: Duration = Duration::from_secs(60);
/// How often load estimates are refreshed from the traffic counters.
const LOAD_SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

struct TickState {
    last_liveness: Instant,
    last_defrag_purge: Instant,
    last_load_sample: Instant,
    load: LoadEstimate,
    last_tx_bytes: u64,
    last_rx_bytes: u64,
}

pub(crate) struct CoreInner {
    pub(crate) config: Config,
    pub(crate) identity: Arc<dyn Identity>,
    pub(crate) time: Arc<dyn TimeProvider>,
    pub(crate) stats: Arc<CoreStats>,
    pub(crate) transports: Multiplexer,
    pub(crate) table: Mutex<ConnectionTable>,
    pub(crate) registry: Mutex<HandlerRegistry>,
    pub(crate) known_hosts: Mutex<KnownHosts>,
    pub(crate) defrag: Mutex<Defragmenter>,
    pub(crate) pingpong: Mutex<PingLedger>,
    pub(crate) queue: InboundQueue,
    pub(crate) rng: Mutex<StdRng>,
    pub(crate) advert: Mutex<AdvertState>,
    allocator: Mutex<InboundAllocator>,
    tick_state: Mutex<TickState>,
    next_fragment_id: AtomicU32,
    shutting_down: AtomicBool,
    /// Optional platform hook for CPU pressure, percent.
    cpu_load: Mutex<Option<Arc<dyn Fn() -> u32 + Send + Sync>>>,
    /// Authenticated public keys seen in validated HELLOs, kept even
    /// for addresses still awaiting PONG verification. The key itself
    /// is self-certifying (its hash is the identity).
    pub(crate) peer_keys: Mutex<std::collections::HashMap<PeerId, [u8; 32]>>,
    /// Handle for deferred actions (ping ledger) back into the core.
    weak_self: Weak<CoreInner>,
}

/// The connection core: owns the table, registries, transports and the
/// periodic machinery, and exposes the connection capability to
/// application modules.
pub struct Core {
    inner: Arc<CoreInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Core {
    pub fn new(
        config: Config,
        identity: Arc<dyn Identity>,
        time: Arc<dyn TimeProvider>,
        drivers: Vec<Arc<dyn Transport>>,
        seed: u64,
    ) -> Self {
        let mut transports = Multiplexer::new();
        for driver in drivers {
            transports.register(driver);
        }
        let mut known_hosts = KnownHosts::new(config.known_hosts_dir());
        known_hosts.load(time.now_unix());
        let now = time.now_instant();
        let inner = Arc::new_cyclic(|weak| CoreInner {
            weak_self: weak.clone(),
            peer_keys: Mutex::new(std::collections::HashMap::new()),
            table: Mutex::new(ConnectionTable::new(config.max_bpm_down())),
            registry: Mutex::new(HandlerRegistry::new()),
            known_hosts: Mutex::new(known_hosts),
            defrag: Mutex::new(Defragmenter::new()),
            pingpong: Mutex::new(PingLedger::new()),
            queue: InboundQueue::new(),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            advert: Mutex::new(AdvertState::new(now, config.max_bpm_down())),
            allocator: Mutex::new(InboundAllocator::new()),
            tick_state: Mutex::new(TickState {
                last_liveness: now,
                last_defrag_purge: now,
                last_load_sample: now,
                load: LoadEstimate::default(),
                last_tx_bytes: 0,
                last_rx_bytes: 0,
            }),
            next_fragment_id: AtomicU32::new(seed as u32 | 1),
            shutting_down: AtomicBool::new(false),
            cpu_load: Mutex::new(None),
            config,
            identity,
            time,
            stats: Arc::new(CoreStats::default()),
            transports,
        });
        Self {
            inner,
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Starts the transport servers, the inbound worker pool and the
    /// periodic driver thread.
    pub fn start(&self) -> CoreResult<()> {
        self.inner.transports.start_all()?;
        let mut workers = self.workers.lock();
        for worker_no in 0..THREAD_COUNT {
            let inner = self.inner.clone();
            let rx = self.inner.queue.receiver();
            workers.push(
                std::thread::Builder::new()
                    .name(format!("veil-inbound-{worker_no}"))
                    .spawn(move || inbound_worker(inner, rx))?,
            );
        }
        let inner = self.inner.clone();
        workers.push(
            std::thread::Builder::new()
                .name("veil-cron".into())
                .spawn(move || {
                    while !inner.shutting_down.load(Ordering::SeqCst) {
                        inner.tick();
                        std::thread::sleep(CRON_INTERVAL);
                    }
                })?,
        );
        info!("core started ({} transports)", self.inner.transports.drivers().len());
        Ok(())
    }

    /// Drains the workers and stops the transports.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        if !handles.is_empty() {
            // The workers keep draining, so the sentinels always fit
            // eventually.
            self.inner.queue.shutdown(THREAD_COUNT);
        }
        for handle in handles {
            let _ = handle.join();
        }
        self.inner.transports.stop_all();
        info!("core stopped");
    }

    /// One pass of the periodic machinery; exposed so tests can drive
    /// time deterministically.
    pub fn tick(&self) {
        self.inner.tick();
    }

    /// Processes every queued inbound datagram on the calling thread.
    /// Lets single-threaded embedders run without the worker pool.
    pub fn drain_inbound(&self) -> usize {
        let mut handled = 0;
        while let Some(item) = self.inner.queue.try_next() {
            match item {
                QueueItem::Packet(packet) => {
                    self.inner.process_packet(packet);
                    handled += 1;
                }
                QueueItem::Shutdown => break,
            }
        }
        handled
    }

    pub fn stats(&self) -> &CoreStats {
        &self.inner.stats
    }

    pub fn own_id(&self) -> PeerId {
        self.inner.identity.own_id()
    }

    /// Entry point for transport drivers delivering one datagram.
    /// False when the handoff queue was full and the datagram dropped.
    pub fn offer_packet(
        &self,
        sender: PeerId,
        session: Option<TransportSession>,
        bytes: Vec<u8>,
    ) -> bool {
        self.inner.queue.offer(
            Packet {
                sender,
                session,
                bytes,
            },
            &self.inner.stats,
        )
    }

    /// Adopts a HELLO from a trusted local source (bootstrap list,
    /// persisted hosts): validated, then bound without the PING
    /// verification dance that network HELLOs go through.
    pub fn trust_hello(&self, hello: Hello) -> CoreResult<()> {
        hello.validate(self.inner.identity.as_ref(), self.inner.time.now_unix())?;
        self.inner
            .peer_keys
            .lock()
            .insert(hello.sender, hello.public_key);
        self.inner.known_hosts.lock().put(hello);
        Ok(())
    }

    /// Feeds a network-received HELLO through the full verification
    /// path, as if it had arrived in a frame.
    pub fn learn_hello(&self, hello: &Hello) -> CoreResult<()> {
        advert::handle_hello(&self.inner, &hello.encode())
    }

    /// Number of bound peer advertisements (rows in the known-hosts
    /// store).
    pub fn known_host_count(&self) -> usize {
        self.inner.known_hosts.lock().len()
    }

    // ---- handler registration ------------------------------------

    pub fn register_handler(&self, kind: MessageKind, handler: PartHandler) -> HandlerId {
        self.inner.registry.lock().register_encrypted(kind, handler)
    }

    pub fn register_plaintext_handler(
        &self,
        kind: MessageKind,
        handler: PlaintextHandler,
    ) -> HandlerId {
        self.inner.registry.lock().register_plaintext(kind, handler)
    }

    pub fn register_send_callback(
        &self,
        min_padding: usize,
        callback: PaddingCallback,
    ) -> HandlerId {
        self.inner
            .registry
            .lock()
            .register_send_callback(min_padding, callback)
    }

    pub fn register_send_notify(&self, observer: SendObserver) -> HandlerId {
        self.inner.registry.lock().register_send_notify(observer)
    }

    pub fn unregister(&self, id: HandlerId) {
        self.inner.registry.lock().unregister(id);
    }

    /// Platform hook for CPU load, percent; influences the knapsack
    /// approximation fallback and queue expiry.
    pub fn set_cpu_load_source(&self, source: Arc<dyn Fn() -> u32 + Send + Sync>) {
        *self.inner.cpu_load.lock() = Some(source);
    }

    // ---- messaging ------------------------------------------------

    /// Queues a prebuilt message toward one peer.
    pub fn unicast(
        &self,
        peer: &PeerId,
        kind: MessageKind,
        body: &[u8],
        priority: u32,
        max_delay: Duration,
    ) -> CoreResult<()> {
        if body.len() + PART_HEADER_LEN > u16::MAX as usize {
            return Err(CoreError::MessageTooLarge {
                size: body.len() + PART_HEADER_LEN,
                limit: u16::MAX as usize,
            });
        }
        self.inner
            .enqueue_part(peer, build_part(kind, body), priority, max_delay, Placement::None)
    }

    /// Queues a lazily built message; `build` fills the part body only
    /// if the message is actually selected for a frame.
    pub fn unicast_callback(
        &self,
        peer: &PeerId,
        kind: MessageKind,
        body_len: usize,
        build: Box<dyn FnOnce(&mut [u8]) -> bool + Send>,
        priority: u32,
        max_delay: Duration,
    ) -> CoreResult<()> {
        let part_len = PART_HEADER_LEN + body_len;
        if part_len > u16::MAX as usize {
            return Err(CoreError::MessageTooLarge {
                size: part_len,
                limit: u16::MAX as usize,
            });
        }
        let deferred = Box::new(move |buf: &mut [u8]| {
            crate::protocol::PartHeader {
                size: buf.len() as u16,
                kind,
            }
            .write_to(buf);
            build(&mut buf[PART_HEADER_LEN..])
        });
        let now = self.inner.time.now_instant();
        let entry = SendEntry::deferred(part_len, deferred, priority, now + max_delay, Placement::None);
        self.inner.enqueue_entry(peer, entry)
    }

    /// Queues a message to every UP peer.
    pub fn broadcast(
        &self,
        kind: MessageKind,
        body: &[u8],
        priority: u32,
        max_delay: Duration,
    ) -> usize {
        let peers: Vec<PeerId> = {
            let table = self.inner.table.lock();
            table
                .iter()
                .filter(|e| e.status == Status::Up)
                .map(|e| e.peer)
                .collect()
        };
        let mut sent = 0;
        for peer in peers {
            if self
                .unicast(&peer, kind, body, priority, max_delay)
                .is_ok()
            {
                sent += 1;
            }
        }
        sent
    }

    /// One-shot plaintext frame over a concrete transport session,
    /// bypassing the scheduler. Handshake traffic only.
    pub fn send_plaintext(&self, session: TransportSession, parts: &[u8]) -> CoreResult<()> {
        self.inner.send_plaintext(session, parts)
    }

    // ---- session management ---------------------------------------

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.inner
            .table
            .lock()
            .lookup(peer)
            .is_some_and(|e| e.status == Status::Up)
    }

    /// Explicit disconnect: HANGUP at extreme priority, then DOWN.
    pub fn disconnect_from_peer(&self, peer: &PeerId) {
        self.inner.hangup_and_down(peer, true);
    }

    /// Opens (or resumes) a session toward a peer known from a HELLO.
    pub fn connect_to_peer(&self, peer: &PeerId) -> CoreResult<()> {
        self.inner.initiate_key_exchange(peer)
    }

    pub fn for_each_connected_node(&self, mut cb: impl FnMut(&PeerId)) -> usize {
        let table = self.inner.table.lock();
        let mut count = 0;
        for entry in table.iter() {
            if entry.status == Status::Up {
                cb(&entry.peer);
                count += 1;
            }
        }
        count
    }

    /// (bytes per minute we grant the peer, last confirmed activity).
    pub fn get_bandwidth_assigned_to(&self, peer: &PeerId) -> Option<(u64, Instant)> {
        self.inner
            .table
            .lock()
            .lookup(peer)
            .filter(|e| e.status == Status::Up)
            .map(|e| (e.idealized_limit, e.last_alive))
    }

    pub fn update_traffic_preference(&self, peer: &PeerId, delta: f64) {
        if let Some(entry) = self.inner.table.lock().lookup_mut(peer) {
            entry.current_connection_value += delta;
        }
    }

    pub fn assign_session_key(
        &self,
        key: SessionKey,
        peer: &PeerId,
        created: u32,
        for_sending: bool,
    ) {
        self.inner.assign_session_key(key, peer, created, for_sending);
    }

    pub fn get_current_session_key(
        &self,
        peer: &PeerId,
        for_sending: bool,
    ) -> Option<(SessionKey, u32)> {
        let table = self.inner.table.lock();
        let entry = table.lookup(peer)?;
        if for_sending {
            entry
                .skey_local
                .clone()
                .map(|k| (k, entry.skey_local_created))
        } else {
            entry
                .skey_remote
                .clone()
                .map(|k| (k, entry.skey_remote_created))
        }
    }

    pub fn confirm_session_up(&self, peer: &PeerId) {
        self.inner.confirm_session_up(peer);
    }

    /// Our current signed advertisements, limited to `max_bytes` of
    /// encoded size. Returns the HELLOs and the bytes they occupy.
    pub fn get_advertised_hellos(&self, max_bytes: usize) -> (Vec<Hello>, usize) {
        let ttl = self.inner.config.hello_ttl();
        let expiration = self.inner.time.now_unix() + ttl.as_secs() as u32;
        let mut used = 0;
        let mut out = Vec::new();
        for hello in self
            .inner
            .transports
            .advertisements(self.inner.identity.as_ref(), expiration)
        {
            let size = hello.encode().len();
            if used + size > max_bytes {
                break;
            }
            used += size;
            out.push(hello);
        }
        (out, used)
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn inbound_worker(inner: Arc<CoreInner>, rx: Receiver<QueueItem>) {
    while let Ok(item) = rx.recv() {
        match item {
            QueueItem::Packet(packet) => inner.process_packet(packet),
            QueueItem::Shutdown => break,
        }
    }
}

impl CoreInner {
    fn cpu_load(&self) -> u32 {
        self.cpu_load.lock().as_ref().map(|f| f()).unwrap_or(0)
    }

    fn load(&self) -> LoadEstimate {
        self.tick_state.lock().load
    }

    // ---- periodic machinery ---------------------------------------

    pub(crate) fn tick(&self) {
        let now = self.time.now_instant();

        self.sample_load(now);
        self.drive_liveness(now);
        self.run_allocation(now);
        advert::drive(self, now);
        self.flush_outbound();
        self.purge_defrag(now);
    }

    fn sample_load(&self, now: Instant) {
        let mut state = self.tick_state.lock();
        let elapsed = now.saturating_duration_since(state.last_load_sample);
        if elapsed < LOAD_SAMPLE_INTERVAL {
            return;
        }
        let tx = self.stats.transmitted_bytes();
        let rx = self.stats.received_bytes();
        let secs = elapsed.as_secs_f64().max(0.001);
        let up_rate = (tx - state.last_tx_bytes) as f64 / secs;
        let down_rate = (rx - state.last_rx_bytes) as f64 / secs;
        state.load = LoadEstimate {
            cpu: self.cpu_load(),
            upload: (up_rate * 100.0 / self.config.max_net_up_bps.max(1) as f64) as u32,
            download: (down_rate * 100.0 / self.config.max_net_down_bps.max(1) as f64) as u32,
        };
        state.last_tx_bytes = tx;
        state.last_rx_bytes = rx;
        state.last_load_sample = now;
    }

    /// Times out dead sessions and keeps idle ones alive with pings.
    fn drive_liveness(&self, now: Instant) {
        {
            let mut state = self.tick_state.lock();
            if now.saturating_duration_since(state.last_liveness) < Duration::from_secs(1) {
                return;
            }
            state.last_liveness = now;
        }

        let mut dead = Vec::new();
        let mut idle = Vec::new();
        {
            let mut table = self.table.lock();
            for entry in table.iter_mut() {
                if entry.is_timed_out(now) {
                    dead.push(entry.peer);
                } else if entry.status == Status::Up
                    && entry.send_buffer.is_empty()
                    && entry
                        .last_send_attempt
                        .is_none_or(|t| {
                            now.saturating_duration_since(t)
                                > INACTIVITY_TIMEOUT / TARGET_MSG_SID
                        })
                {
                    idle.push(entry.peer);
                }
            }
            table.sweep_down();
        }
        for peer in dead {
            debug!("liveness timeout for {peer}");
            self.hangup_and_down(&peer, true);
        }
        for peer in idle {
            self.send_keepalive(&peer);
        }
    }

    fn send_keepalive(&self, peer: &PeerId) {
        let now = self.time.now_instant();
        let body = {
            let mut ledger = self.pingpong.lock();
            let mut rng = self.rng.lock();
            // Keepalive pongs refresh the session through the normal
            // decrypt path; the ledger action itself is a no-op.
            ledger.register(*peer, Box::new(|| {}), now, &mut *rng)
        };
        let _ = self.enqueue_part(
            peer,
            build_part(MessageKind::PING, &body.encode()),
            ADMIN_PRIORITY,
            Duration::ZERO, // send now, don't batch
            Placement::None,
        );
    }

    fn run_allocation(&self, now: Instant) {
        let actions = {
            let mut table = self.table.lock();
            let capacity = table.capacity();
            let mut entries = table.up_entries_mut();
            let mut allocator = self.allocator.lock();
            let mut rng = self.rng.lock();
            allocator.run(
                &mut entries,
                capacity,
                self.config.max_bpm_down(),
                self.load().download,
                now,
                &mut *rng,
            )
        };
        for (peer, duration) in actions.blacklist {
            self.identity.blacklist(&peer, duration, true);
            self.hangup_and_down(&peer, false);
        }
        for peer in actions.cull {
            self.hangup_and_down(&peer, true);
        }
    }

    fn purge_defrag(&self, now: Instant) {
        let mut state = self.tick_state.lock();
        if now.saturating_duration_since(state.last_defrag_purge) < DEFRAG_PURGE_INTERVAL {
            return;
        }
        state.last_defrag_purge = now;
        drop(state);
        self.defrag.lock().purge(now);
        self.known_hosts.lock().remove_expired(self.time.now_unix());
    }

    /// Attempts one frame for every UP entry with queued work.
    fn flush_outbound(&self) {
        let candidates: Vec<PeerId> = {
            let table = self.table.lock();
            table
                .iter()
                .filter(|e| {
                    e.status == Status::Up && !e.send_buffer.is_empty() && !e.in_send_buffer
                })
                .map(|e| e.peer)
                .collect()
        };
        for peer in candidates {
            self.try_send_frame(&peer, false);
        }
    }

    // ---- outbound path --------------------------------------------

    pub(crate) fn enqueue_part(
        &self,
        peer: &PeerId,
        part: Vec<u8>,
        priority: u32,
        max_delay: Duration,
        placement: Placement,
    ) -> CoreResult<()> {
        let now = self.time.now_instant();
        let entry = SendEntry::ready(part, priority, now + max_delay, placement);
        self.enqueue_entry(peer, entry)
    }

    fn enqueue_entry(&self, peer: &PeerId, entry: SendEntry) -> CoreResult<()> {
        let now = self.time.now_instant();
        let cpu = self.load().cpu;
        let max_bpm_up = self.config.max_bpm_up();
        let mut table = self.table.lock();
        let be = table.add_host(*peer, now);

        // A packetized transport cannot carry oversized parts whole.
        let capacity = if be.mtu > 0 {
            be.mtu as usize - PACKET_HEADER_LEN
        } else {
            usize::MAX
        };
        if entry.len > capacity {
            let overhead = PART_HEADER_LEN + FragmentBody::FIXED_LEN;
            if capacity <= overhead {
                self.stats.add_dropped(entry.len as u64);
                return Err(CoreError::MessageTooLarge {
                    size: entry.len,
                    limit: capacity,
                });
            }
            let Some(entry) = materialize(entry) else {
                return Ok(());
            };
            let SendBody::Ready(bytes) = &entry.body else {
                unreachable!("materialize yields ready bodies");
            };
            let id = FragmentId(self.next_fragment_id.fetch_add(1, Ordering::Relaxed));
            for frag in fragment::split_message(id, capacity - overhead, bytes) {
                let part = build_part(MessageKind::FRAGMENT, &frag.encode());
                be.enqueue(SendEntry::ready(
                    part,
                    entry.priority,
                    entry.deadline,
                    Placement::None,
                ));
            }
            return Ok(());
        }

        if be.queued_bytes() + entry.len > MAX_SEND_BUFFER_SIZE {
            be.expire_send_buffer(now, cpu, max_bpm_up, &self.stats);
            if be.queued_bytes() + entry.len > MAX_SEND_BUFFER_SIZE {
                self.stats.add_dropped(entry.len as u64);
                return Err(CoreError::QueueFull);
            }
        }
        be.enqueue(entry);
        Ok(())
    }

    /// Ensures the row has a bound transport session; splits anything
    /// the (possibly new) MTU cannot carry.
    fn ensure_transport(&self, be: &mut BufferEntry, now: Instant) -> bool {
        if be.tsession.is_some() {
            return true;
        }
        if self.identity.is_blacklisted(&be.peer) {
            return false;
        }
        let now_unix = self.time.now_unix();
        let hello = {
            let known = self.known_hosts.lock();
            known
                .best_for(&be.peer, now, now_unix, |kind| self.transports.cost(kind))
                .cloned()
        };
        let Some(hello) = hello else {
            return false;
        };
        match self.transports.connect(&hello) {
            Ok(session) => {
                be.tsession = Some(session);
                be.mtu = session.mtu;
                self.known_hosts
                    .lock()
                    .report_success(&be.peer, hello.transport);
                self.refragment_oversized(be);
                true
            }
            Err(e) => {
                debug!("connect to {} failed: {e}", be.peer);
                self.known_hosts
                    .lock()
                    .report_failure(&be.peer, hello.transport, now);
                false
            }
        }
    }

    /// After an MTU change, queued parts may no longer fit one frame.
    fn refragment_oversized(&self, be: &mut BufferEntry) {
        if be.mtu == 0 {
            return;
        }
        let capacity = be.mtu as usize - PACKET_HEADER_LEN;
        let oversized: Vec<usize> = be
            .send_buffer
            .iter()
            .enumerate()
            .filter(|(_, e)| e.len > capacity)
            .map(|(i, _)| i)
            .collect();
        let overhead = PART_HEADER_LEN + FragmentBody::FIXED_LEN;
        if capacity <= overhead {
            return;
        }
        for i in oversized.into_iter().rev() {
            let Some(entry) = materialize(be.send_buffer.remove(i)) else {
                continue;
            };
            let SendBody::Ready(bytes) = &entry.body else {
                unreachable!("materialize yields ready bodies");
            };
            let id = FragmentId(self.next_fragment_id.fetch_add(1, Ordering::Relaxed));
            for frag in fragment::split_message(id, capacity - overhead, bytes) {
                be.enqueue(SendEntry::ready(
                    build_part(MessageKind::FRAGMENT, &frag.encode()),
                    entry.priority,
                    entry.deadline,
                    Placement::None,
                ));
            }
        }
    }

    /// Selection and sealing happen under the table lock; the actual
    /// transport send runs with the lock released and the entry marked
    /// busy, so other threads can work on other rows meanwhile.
    fn try_send_frame(&self, peer: &PeerId, force: bool) {
        let now = self.time.now_instant();
        let now_unix = self.time.now_unix();
        let load = self.load();
        let max_bpm_up = self.config.max_bpm_up();
        let padding: Vec<(usize, PaddingCallback)> = {
            let registry = self.registry.lock();
            registry
                .padding_callbacks()
                .iter()
                .map(|(_, min, cb)| (*min, cb.clone()))
                .collect()
        };

        let (plan, session) = {
            let mut table = self.table.lock();
            let Some(be) = table.lookup_mut(peer) else {
                return;
            };
            if be.status != Status::Up || be.send_buffer.is_empty() || be.in_send_buffer {
                return;
            }
            if !self.ensure_transport(be, now) {
                return;
            }
            let session = be.tsession.expect("bound above");
            let mut rng = self.rng.lock();
            let mut ctx = AssemblyContext {
                now,
                now_unix,
                rng: &mut *rng,
                padding: &padding,
                stats: &self.stats,
                load,
                padding_enabled: self.config.experimental_padding,
                max_bpm_up,
            };
            let outcome = scheduler::plan_frame(be, &mut ctx, force, |size, extreme| {
                self.transports.would_try(session, size, extreme)
            });
            match outcome {
                PlanOutcome::Planned(plan) => {
                    be.in_send_buffer = true;
                    (plan, session)
                }
                PlanOutcome::Idle => return,
                PlanOutcome::SessionDead => {
                    self.transports.disconnect(session);
                    be.tsession = None;
                    return;
                }
            }
        };

        let extreme = plan.priority >= EXTREME_PRIORITY as u64;
        let mut outcome = self.transports.send(session, &plan.bytes, false);
        if outcome == SendOutcome::NotReady && extreme {
            outcome = self.transports.send(session, &plan.bytes, true);
        }

        let observers: Vec<SendObserver> = {
            let registry = self.registry.lock();
            registry
                .observers()
                .iter()
                .map(|(_, obs)| obs.clone())
                .collect()
        };
        let mut table = self.table.lock();
        let Some(be) = table.lookup_mut(peer) else {
            return;
        };
        scheduler::finish_frame(
            be,
            plan,
            outcome,
            &observers,
            &self.stats,
            now,
            load.cpu,
            max_bpm_up,
        );
        be.in_send_buffer = false;
        if outcome == SendOutcome::Dead {
            warn!("transport session to {} died", be.peer);
            if let Some(session) = be.tsession.take() {
                self.transports.disconnect(session);
            }
        }
    }

    /// Builds and sends one plaintext frame over a concrete session:
    /// all-zero trailer, MAC set to the hash of the body.
    pub(crate) fn send_plaintext(
        &self,
        session: TransportSession,
        parts: &[u8],
    ) -> CoreResult<()> {
        let mut frame = vec![0u8; PACKET_HEADER_LEN + parts.len()];
        frame[PACKET_HEADER_LEN..].copy_from_slice(parts);
        let mac = crate::crypto::hash_mac(parts);
        frame[..crate::protocol::MAC_LEN].copy_from_slice(&mac);
        match self.transports.send(session, &frame, false) {
            SendOutcome::Sent => Ok(()),
            SendOutcome::NotReady => Err(CoreError::TransportNotReady),
            SendOutcome::Dead => Err(CoreError::TransportFailed("session dead".into())),
        }
    }

    /// HANGUP procedure: extreme-priority tail part, frequency gate
    /// bypassed, then keys zeroed and the row reset to DOWN.
    pub(crate) fn hangup_and_down(&self, peer: &PeerId, send_hangup: bool) {
        let now = self.time.now_instant();
        let can_send = {
            let table = self.table.lock();
            table
                .lookup(peer)
                .is_some_and(|e| e.status == Status::Up && e.skey_local.is_some())
        };
        if send_hangup && can_send {
            let body = HangupBody {
                sender: self.identity.own_id(),
            };
            let _ = self.enqueue_part(
                peer,
                build_part(MessageKind::HANGUP, &body.encode()),
                EXTREME_PRIORITY,
                Duration::from_secs(0),
                Placement::Tail,
            );
            self.try_send_frame(peer, true);
        }
        let mut table = self.table.lock();
        if let Some(be) = table.lookup_mut(peer) {
            if let Some(session) = be.tsession.take() {
                self.transports.disconnect(session);
            }
            be.shutdown(now);
        }
    }

    // ---- session keys and handshake -------------------------------

    pub(crate) fn assign_session_key(
        &self,
        key: SessionKey,
        peer: &PeerId,
        created: u32,
        for_sending: bool,
    ) {
        let now = self.time.now_instant();
        let mut table = self.table.lock();
        let be = table.add_host(*peer, now);
        if for_sending {
            be.skey_local = Some(key);
            be.skey_local_created = created;
            if be.status == Status::Down {
                be.set_status(Status::KeySent, now);
            }
        } else {
            if created < be.skey_remote_created {
                debug!("{peer}: ignoring older session key");
                return;
            }
            be.skey_remote = Some(key);
            be.skey_remote_created = created;
            if be.status == Status::Down || be.status == Status::KeySent {
                be.set_status(Status::KeyReceived, now);
            }
        }
    }

    pub(crate) fn confirm_session_up(&self, peer: &PeerId) {
        let now = self.time.now_instant();
        let mut table = self.table.lock();
        if let Some(be) = table.lookup_mut(peer) {
            if be.skey_local.is_some() && be.skey_remote.is_some() && be.status != Status::Up {
                be.set_status(Status::Up, now);
                be.last_alive = now;
            }
        }
    }

    /// DOWN → KEY_SENT: generates a fresh session key and sends
    /// HELLO + SETKEY + PING in the clear toward a known address.
    pub(crate) fn initiate_key_exchange(&self, peer: &PeerId) -> CoreResult<()> {
        let now = self.time.now_instant();
        let now_unix = self.time.now_unix();
        if self.identity.is_blacklisted(peer) {
            return Err(CoreError::NotConnected);
        }

        let hello = {
            let known = self.known_hosts.lock();
            known
                .best_for(peer, now, now_unix, |kind| self.transports.cost(kind))
                .cloned()
        }
        .ok_or(CoreError::NoTransport)?;

        let key = {
            let mut table = self.table.lock();
            let be = table.add_host(*peer, now);
            match be.status {
                Status::Down => {
                    let mut rng = self.rng.lock();
                    let key = SessionKey::random(&mut *rng);
                    be.skey_local = Some(key.clone());
                    be.skey_local_created = now_unix;
                    be.set_status(Status::KeySent, now);
                    key
                }
                // Handshake already in progress (or up); nothing to do.
                _ => return Ok(()),
            }
        };

        let wrapped = self
            .identity
            .wrap_session_key(&hello.public_key, &key)
            .ok_or(CoreError::Identity(
                crate::identity::IdentityError::KeyWrap,
            ))?;
        let signature = self
            .identity
            .sign(&SetKeyBody::signed_payload(now_unix, &wrapped, peer));
        let setkey = SetKeyBody {
            creation_time: now_unix,
            wrapped_key: wrapped,
            signature,
        };

        let ping = {
            let mut ledger = self.pingpong.lock();
            let mut rng = self.rng.lock();
            let weak = self.weak();
            let peer = *peer;
            ledger.register(
                peer,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.confirm_session_up(&peer);
                    }
                }),
                now,
                &mut *rng,
            )
        };

        let mut parts = Vec::new();
        if let Some(own_hello) = self.own_hello_for(hello.transport) {
            parts.extend_from_slice(&build_part(MessageKind::HELLO, &own_hello.encode()));
        }
        parts.extend_from_slice(&build_part(MessageKind::SET_KEY, &setkey.encode()));
        parts.extend_from_slice(&build_part(MessageKind::PING, &ping.encode()));

        let session = self.session_for(peer, &hello, now)?;
        self.send_plaintext(session, &parts)
    }

    /// Reuses the row's bound session or opens one from the HELLO.
    fn session_for(
        &self,
        peer: &PeerId,
        hello: &Hello,
        now: Instant,
    ) -> CoreResult<TransportSession> {
        {
            let table = self.table.lock();
            if let Some(session) = table.lookup(peer).and_then(|e| e.tsession) {
                return Ok(session);
            }
        }
        match self.transports.connect(hello) {
            Ok(session) => {
                let mut table = self.table.lock();
                let be = table.add_host(*peer, now);
                be.tsession = Some(session);
                be.mtu = session.mtu;
                Ok(session)
            }
            Err(e) => {
                self.known_hosts
                    .lock()
                    .report_failure(peer, hello.transport, now);
                Err(e)
            }
        }
    }

    pub(crate) fn own_hello_for(&self, transport: crate::protocol::TransportKind) -> Option<Hello> {
        let ttl = self.config.hello_ttl();
        let expiration = self.time.now_unix() + ttl.as_secs() as u32;
        self.transports
            .advertisements(self.identity.as_ref(), expiration)
            .into_iter()
            .find(|h| h.transport == transport)
    }

    // ---- inbound path ---------------------------------------------

    fn process_packet(&self, packet: Packet) {
        let Packet {
            sender,
            session,
            mut bytes,
        } = packet;
        if self.identity.is_blacklisted_strict(&sender) {
            debug!("dropping datagram from blacklisted {sender}");
            return;
        }

        let now = self.time.now_instant();
        let now_unix = self.time.now_unix();
        let outcome = {
            let mut table = self.table.lock();
            let be = table.lookup_mut(&sender);
            let outcome = inbound::check_header(be, &mut bytes, now, now_unix, &self.stats);
            if matches!(outcome, HeaderOutcome::Decrypted) {
                // First decryptable frame confirms the session.
                if let Some(be) = table.lookup_mut(&sender) {
                    if be.status == Status::KeyReceived {
                        be.set_status(Status::Up, now);
                    }
                    if be.tsession.is_none()
                        && let Some(s) = session
                        && self
                            .transports
                            .get(s.kind)
                            .is_some_and(|d| d.associate(s))
                    {
                        be.tsession = Some(s);
                        be.mtu = s.mtu;
                    }
                }
            }
            outcome
        };

        match outcome {
            HeaderOutcome::Plaintext => {
                let parts = bytes[PACKET_HEADER_LEN..].to_vec();
                self.demux(&sender, session, &parts, false);
            }
            HeaderOutcome::Decrypted => {
                let parts = bytes[PACKET_HEADER_LEN..].to_vec();
                self.demux(&sender, session, &parts, true);
            }
            HeaderOutcome::Dropped { rekey } => {
                if rekey {
                    let _ = self.initiate_key_exchange(&sender);
                }
            }
        }
    }

    /// Walks the parts of one frame. Core kinds are dispatched inline;
    /// everything else goes through the registered handler chains,
    /// where the first error aborts the remaining parts.
    fn demux(&self, sender: &PeerId, session: Option<TransportSession>, parts: &[u8], encrypted: bool) {
        for part in crate::protocol::PartIter::new(parts) {
            let (kind, body) = match part {
                Ok(p) => p,
                Err(e) => {
                    debug!("malformed part from {sender}: {e}");
                    return;
                }
            };
            let result = match kind {
                MessageKind::NOISE => Ok(()),
                MessageKind::HELLO => advert::handle_hello(self, &body),
                MessageKind::SET_KEY => self.handle_setkey(sender, session, &body),
                MessageKind::PING => self.handle_ping(sender, session, &body, encrypted),
                MessageKind::PONG => self.handle_pong(sender, &body),
                MessageKind::HANGUP if encrypted => self.handle_hangup(sender, &body),
                MessageKind::FRAGMENT if encrypted => {
                    self.handle_fragment(sender, session, &body)
                }
                _ => self.dispatch_registered(sender, session, kind, &body, encrypted),
            };
            if let Err(e) = result {
                debug!("part {kind} from {sender} aborted frame: {e}");
                return;
            }
        }
    }

    fn dispatch_registered(
        &self,
        sender: &PeerId,
        session: Option<TransportSession>,
        kind: MessageKind,
        body: &[u8],
        encrypted: bool,
    ) -> CoreResult<()> {
        // Chains are cloned out so no registry lock is held while a
        // handler runs (handlers may call back into the core).
        if encrypted {
            let chain: SmallVec<[PartHandler; 4]> = {
                let registry = self.registry.lock();
                registry
                    .encrypted_chain(kind)
                    .iter()
                    .map(|(_, h)| h.clone())
                    .collect()
            };
            if chain.is_empty() {
                debug!("no handler for encrypted kind {kind}");
                return Ok(());
            }
            for handler in chain {
                handler(sender, body)?;
            }
        } else {
            let chain: SmallVec<[PlaintextHandler; 4]> = {
                let registry = self.registry.lock();
                registry
                    .plaintext_chain(kind)
                    .iter()
                    .map(|(_, h)| h.clone())
                    .collect()
            };
            if chain.is_empty() {
                debug!("no handler for plaintext kind {kind}");
                return Ok(());
            }
            for handler in chain {
                handler(sender, session, body)?;
            }
        }
        Ok(())
    }

    fn handle_setkey(
        &self,
        sender: &PeerId,
        session: Option<TransportSession>,
        body: &[u8],
    ) -> CoreResult<()> {
        let setkey = SetKeyBody::decode(body)?;
        let sender_pk = self.peer_keys.lock().get(sender).copied().or_else(|| {
            let known = self.known_hosts.lock();
            known
                .iter()
                .find(|h| h.sender == *sender)
                .map(|h| h.public_key)
        });
        let Some(sender_pk) = sender_pk else {
            debug!("{sender}: SETKEY from peer with no known HELLO");
            return Ok(());
        };
        let payload =
            SetKeyBody::signed_payload(setkey.creation_time, &setkey.wrapped_key, &self.identity.own_id());
        if !self.identity.verify(&sender_pk, &payload, &setkey.signature) {
            warn!("{sender}: SETKEY signature invalid");
            return Ok(());
        }
        let Some(key) = self
            .identity
            .unwrap_session_key(&sender_pk, &setkey.wrapped_key)
        else {
            warn!("{sender}: cannot unwrap session key");
            return Ok(());
        };

        let was_down = {
            let table = self.table.lock();
            table
                .lookup(sender)
                .map(|e| e.status == Status::Down)
                .unwrap_or(true)
        };
        self.assign_session_key(key, sender, setkey.creation_time, false);
        if was_down {
            // They initiated; answer with our half of the exchange.
            let _ = self.initiate_key_exchange_reply(sender, session);
        }
        Ok(())
    }

    /// Our half of an exchange the peer started: we are KEY_RECEIVED
    /// and send HELLO + SETKEY + PING back, preferably over the
    /// session their SETKEY arrived on (the advertised address may
    /// still be unverified).
    fn initiate_key_exchange_reply(
        &self,
        peer: &PeerId,
        inbound_session: Option<TransportSession>,
    ) -> CoreResult<()> {
        let now = self.time.now_instant();
        let now_unix = self.time.now_unix();
        let peer_pk = self
            .peer_keys
            .lock()
            .get(peer)
            .copied()
            .ok_or(CoreError::NoSessionKey)?;

        let key = {
            let mut table = self.table.lock();
            let be = table.add_host(*peer, now);
            if be.skey_local.is_some() {
                return Ok(()); // already sent our key
            }
            let mut rng = self.rng.lock();
            let key = SessionKey::random(&mut *rng);
            be.skey_local = Some(key.clone());
            be.skey_local_created = now_unix;
            key
        };

        let wrapped = self
            .identity
            .wrap_session_key(&peer_pk, &key)
            .ok_or(CoreError::Identity(crate::identity::IdentityError::KeyWrap))?;
        let signature = self
            .identity
            .sign(&SetKeyBody::signed_payload(now_unix, &wrapped, peer));
        let setkey = SetKeyBody {
            creation_time: now_unix,
            wrapped_key: wrapped,
            signature,
        };
        let ping = {
            let mut ledger = self.pingpong.lock();
            let mut rng = self.rng.lock();
            let weak = self.weak();
            let peer = *peer;
            ledger.register(
                peer,
                Box::new(move || {
                    if let Some(inner) = weak.upgrade() {
                        inner.confirm_session_up(&peer);
                    }
                }),
                now,
                &mut *rng,
            )
        };

        // Bind the inbound session if the driver lets us keep it.
        let session = match inbound_session {
            Some(s) if self.transports.get(s.kind).is_some_and(|d| d.associate(s)) => {
                let mut table = self.table.lock();
                let be = table.add_host(*peer, now);
                be.tsession = Some(s);
                be.mtu = s.mtu;
                s
            }
            _ => {
                let hello = {
                    let known = self.known_hosts.lock();
                    known
                        .best_for(peer, now, now_unix, |kind| self.transports.cost(kind))
                        .cloned()
                }
                .ok_or(CoreError::NoTransport)?;
                self.session_for(peer, &hello, now)?
            }
        };

        let mut parts = Vec::new();
        if let Some(own_hello) = self.own_hello_for(session.kind) {
            parts.extend_from_slice(&build_part(MessageKind::HELLO, &own_hello.encode()));
        }
        parts.extend_from_slice(&build_part(MessageKind::SET_KEY, &setkey.encode()));
        parts.extend_from_slice(&build_part(MessageKind::PING, &ping.encode()));
        self.send_plaintext(session, &parts)
    }

    fn handle_ping(
        &self,
        sender: &PeerId,
        session: Option<TransportSession>,
        body: &[u8],
        encrypted: bool,
    ) -> CoreResult<()> {
        let ping = PingPongBody::decode(body)?;
        if ping.receiver != self.identity.own_id() {
            debug!("PING from {sender} not destined for us");
            return Ok(());
        }
        let pong = build_part(MessageKind::PONG, body);
        if encrypted {
            let _ = self.enqueue_part(
                sender,
                pong,
                ADMIN_PRIORITY,
                Duration::from_secs(0),
                Placement::None,
            );
            self.try_send_frame(sender, false);
            return Ok(());
        }
        // Plaintext path: answer over the inbound session if it can
        // carry the reply, otherwise via a one-shot connection.
        if let Some(session) = session {
            if self.send_plaintext(session, &pong).is_ok() {
                return Ok(());
            }
        }
        let now = self.time.now_instant();
        let now_unix = self.time.now_unix();
        let hello = {
            let known = self.known_hosts.lock();
            known
                .best_for(sender, now, now_unix, |kind| self.transports.cost(kind))
                .cloned()
        };
        if let Some(hello) = hello {
            if let Ok(session) = self.transports.connect(&hello) {
                let result = self.send_plaintext(session, &pong);
                self.transports.disconnect(session);
                result?;
            }
        }
        Ok(())
    }

    fn handle_pong(&self, sender: &PeerId, body: &[u8]) -> CoreResult<()> {
        let pong = PingPongBody::decode(body)?;
        // A valid PONG echoes our PING verbatim, so its receiver field
        // names the peer that sent it.
        if pong.receiver != *sender {
            debug!("PONG from {sender} with foreign receiver");
            return Ok(());
        }
        self.pingpong.lock().pong_received(sender, pong.challenge);
        let now = self.time.now_instant();
        if let Some(be) = self.table.lock().lookup_mut(sender) {
            be.last_alive = now;
        }
        Ok(())
    }

    fn handle_hangup(&self, sender: &PeerId, body: &[u8]) -> CoreResult<()> {
        let hangup = HangupBody::decode(body)?;
        if hangup.sender != *sender {
            return Err(CoreError::Wire("hangup sender mismatch"));
        }
        debug!("received HANGUP from {sender}");
        let now = self.time.now_instant();
        let mut table = self.table.lock();
        if let Some(be) = table.lookup_mut(sender) {
            if let Some(session) = be.tsession.take() {
                self.transports.disconnect(session);
            }
            be.shutdown(now);
        }
        Ok(())
    }

    fn handle_fragment(
        &self,
        sender: &PeerId,
        session: Option<TransportSession>,
        body: &[u8],
    ) -> CoreResult<()> {
        let frag = FragmentBody::decode(body)?;
        let now = self.time.now_instant();
        let assembled = self.defrag.lock().add_fragment(sender, frag, now);
        if let Some(message) = assembled {
            // The reassembled bytes are ordinary frame parts.
            self.demux(sender, session, &message, true);
        }
        Ok(())
    }

    pub(crate) fn weak(&self) -> Weak<CoreInner> {
        self.weak_self.clone()
    }
}

/// Forces a deferred body into bytes so it can be split; a failed
/// builder drops the message.
fn materialize(mut entry: SendEntry) -> Option<SendEntry> {
    if let SendBody::Deferred(_) = entry.body {
        let SendBody::Deferred(build) =
            std::mem::replace(&mut entry.body, SendBody::Ready(Vec::new()))
        else {
            unreachable!()
        };
        let mut buf = vec![0u8; entry.len];
        if !build(&mut buf) {
            return None;
        }
        entry.body = SendBody::Ready(buf);
    }
    Some(entry)
}
