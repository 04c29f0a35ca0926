use crate::error::{CoreError, CoreResult};
use crate::hello::Hello;
use crate::identity::Identity;
use crate::protocol::TransportKind;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Handle to one bound driver session. The driver owns the actual
/// socket; the core only keeps this copyable handle plus the driver's
/// kind so the pairing can be re-resolved through the multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSession {
    pub kind: TransportKind,
    pub id: u64,
    /// 0 for streaming transports, else the datagram payload limit.
    pub mtu: u16,
}

/// Outcome of a driver send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Temporary: the driver's buffer is full, retry next tick.
    NotReady,
    /// Fatal: the session is gone and must be disconnected.
    Dead,
}

/// Transport driver capability.
///
/// Concrete UDP/TCP/HTTP drivers live outside the core; the in-memory
/// [`MemoryTransport`] below stands in for them in tests.
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;
    /// 0 means streaming; otherwise the datagram size limit.
    fn mtu(&self) -> u16;
    /// Relative cost used to pick among several HELLOs for one peer.
    fn cost(&self) -> u32;
    /// NAT-type transports cannot be advertised.
    fn is_nat(&self) -> bool {
        false
    }

    /// The driver's current address bytes for HELLO construction, or
    /// none when the driver cannot be reached from outside.
    fn advertised_address(&self) -> Option<Vec<u8>>;
    /// Sanity-checks the address of a received HELLO.
    fn verify_advertisement(&self, hello: &Hello) -> bool;

    fn connect(&self, hello: &Hello) -> CoreResult<TransportSession>;
    /// Takes an additional reference on an inbound session so it can be
    /// kept past the handler invocation. False if the session is gone.
    fn associate(&self, session: TransportSession) -> bool;
    fn disconnect(&self, session: TransportSession);
    fn send(&self, session: TransportSession, bytes: &[u8], force: bool) -> SendOutcome;
    /// Would `send` currently accept this many bytes?
    fn would_try(&self, session: TransportSession, size: usize, force: bool) -> SendOutcome;

    fn start_server(&self) -> CoreResult<()> {
        Ok(())
    }
    fn stop_server(&self) {}

    fn address_to_string(&self, hello: &Hello) -> String {
        hex::encode(&hello.address)
    }
}

/// Registry of transport drivers; advertises, connects and sends over
/// whichever driver fits.
pub struct Multiplexer {
    drivers: Vec<Arc<dyn Transport>>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self {
            drivers: Vec::new(),
        }
    }

    pub fn register(&mut self, driver: Arc<dyn Transport>) {
        debug!("registered transport {}", driver.kind());
        self.drivers.push(driver);
    }

    pub fn get(&self, kind: TransportKind) -> Option<&Arc<dyn Transport>> {
        self.drivers.iter().find(|d| d.kind() == kind)
    }

    pub fn drivers(&self) -> &[Arc<dyn Transport>] {
        &self.drivers
    }

    pub fn mtu(&self, kind: TransportKind) -> u16 {
        self.get(kind).map(|d| d.mtu()).unwrap_or(0)
    }

    pub fn cost(&self, kind: TransportKind) -> u32 {
        self.get(kind).map(|d| d.cost()).unwrap_or(u32::MAX)
    }

    /// Builds a freshly signed HELLO per non-NAT driver.
    pub fn advertisements(
        &self,
        identity: &dyn Identity,
        expiration: u32,
    ) -> Vec<Hello> {
        let mut out = Vec::new();
        for driver in &self.drivers {
            if driver.is_nat() {
                continue;
            }
            let Some(address) = driver.advertised_address() else {
                continue;
            };
            out.push(Hello::build(
                identity,
                driver.kind(),
                driver.mtu(),
                expiration,
                address,
            ));
        }
        out
    }

    pub fn connect(&self, hello: &Hello) -> CoreResult<TransportSession> {
        let driver = self.get(hello.transport).ok_or(CoreError::NoTransport)?;
        driver.connect(hello)
    }

    pub fn disconnect(&self, session: TransportSession) {
        if let Some(driver) = self.get(session.kind) {
            driver.disconnect(session);
        }
    }

    pub fn send(
        &self,
        session: TransportSession,
        bytes: &[u8],
        force: bool,
    ) -> SendOutcome {
        match self.get(session.kind) {
            Some(driver) => driver.send(session, bytes, force),
            None => SendOutcome::Dead,
        }
    }

    pub fn would_try(
        &self,
        session: TransportSession,
        size: usize,
        force: bool,
    ) -> SendOutcome {
        match self.get(session.kind) {
            Some(driver) => driver.would_try(session, size, force),
            None => SendOutcome::Dead,
        }
    }

    pub fn start_all(&self) -> CoreResult<()> {
        for driver in &self.drivers {
            driver.start_server()?;
        }
        Ok(())
    }

    pub fn stop_all(&self) {
        for driver in &self.drivers {
            driver.stop_server();
        }
    }
}

impl Default for Multiplexer {
    fn default() -> Self {
        Self::new()
    }
}

/// Datagram delivered by the in-memory hub: (destination address,
/// source address, bytes).
pub type HubDelivery = (u64, u64, Vec<u8>);

/// Shared switchboard connecting [`MemoryTransport`] instances, so two
/// cores can talk inside one test process.
#[derive(Default)]
pub struct MemoryHub {
    inboxes: Mutex<HashMap<u64, VecDeque<(u64, Vec<u8>)>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn attach(&self, address: u64) {
        self.inboxes.lock().entry(address).or_default();
    }

    fn push(&self, to: u64, from: u64, bytes: Vec<u8>) -> bool {
        let mut inboxes = self.inboxes.lock();
        match inboxes.get_mut(&to) {
            Some(queue) => {
                queue.push_back((from, bytes));
                true
            }
            None => false,
        }
    }

    /// Drains one pending datagram for `address`.
    pub fn poll(&self, address: u64) -> Option<(u64, Vec<u8>)> {
        self.inboxes.lock().get_mut(&address)?.pop_front()
    }
}

/// Loopback driver used by the test suite; addresses are plain u64
/// mailbox numbers encoded big-endian in the HELLO address field.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    address: u64,
    mtu: u16,
    kind: TransportKind,
}

impl MemoryTransport {
    pub const KIND: TransportKind = TransportKind(1);

    pub fn new(hub: Arc<MemoryHub>, address: u64, mtu: u16) -> Self {
        hub.attach(address);
        Self {
            hub,
            address,
            mtu,
            kind: Self::KIND,
        }
    }

    fn peer_address(hello: &Hello) -> Option<u64> {
        let bytes: [u8; 8] = hello.address.as_slice().try_into().ok()?;
        Some(u64::from_be_bytes(bytes))
    }
}

impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn cost(&self) -> u32 {
        100
    }

    fn advertised_address(&self) -> Option<Vec<u8>> {
        Some(self.address.to_be_bytes().to_vec())
    }

    fn verify_advertisement(&self, hello: &Hello) -> bool {
        hello.address.len() == 8
    }

    fn connect(&self, hello: &Hello) -> CoreResult<TransportSession> {
        let peer = Self::peer_address(hello).ok_or(CoreError::NoTransport)?;
        Ok(TransportSession {
            kind: self.kind,
            id: peer,
            mtu: self.mtu,
        })
    }

    fn associate(&self, _session: TransportSession) -> bool {
        true
    }

    fn disconnect(&self, _session: TransportSession) {}

    fn send(&self, session: TransportSession, bytes: &[u8], _force: bool) -> SendOutcome {
        if self.mtu != 0 && bytes.len() > self.mtu as usize {
            return SendOutcome::Dead;
        }
        if self.hub.push(session.id, self.address, bytes.to_vec()) {
            SendOutcome::Sent
        } else {
            SendOutcome::Dead
        }
    }

    fn would_try(&self, _session: TransportSession, size: usize, _force: bool) -> SendOutcome {
        if self.mtu != 0 && size > self.mtu as usize {
            SendOutcome::Dead
        } else {
            SendOutcome::Sent
        }
    }
}
