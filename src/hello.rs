use crate::error::CoreError;
use crate::flat_map::FlatMap;
use crate::identity::{Identity, PeerId};
use crate::protocol::{TransportKind, read_u16, read_u32};
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// HELLOs may not promise validity further ahead than this.
pub const MAX_HELLO_AGE: Duration = Duration::from_secs(10 * 24 * 3600);

/// Signed peer advertisement for one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub transport: TransportKind,
    pub mtu: u16,
    /// Unix seconds after which the advertisement is void.
    pub expiration: u32,
    pub public_key: [u8; 32],
    pub sender: PeerId,
    pub signature: [u8; 64],
    pub address: Vec<u8>,
}

impl Hello {
    const FIXED_LEN: usize = 2 + 2 + 2 + 4 + 32 + PeerId::LEN + 64;

    /// Builds and signs an advertisement for our own node.
    pub fn build(
        identity: &dyn Identity,
        transport: TransportKind,
        mtu: u16,
        expiration: u32,
        address: Vec<u8>,
    ) -> Self {
        let mut hello = Self {
            transport,
            mtu,
            expiration,
            public_key: identity.own_public_key(),
            sender: identity.own_id(),
            signature: [0u8; 64],
            address,
        };
        hello.signature = identity.sign(&hello.signed_bytes());
        hello
    }

    /// Everything the signature covers: the whole record except the
    /// signature field itself.
    fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_LEN - 64 + self.address.len());
        out.extend_from_slice(&self.transport.0.to_be_bytes());
        out.extend_from_slice(&self.mtu.to_be_bytes());
        out.extend_from_slice(&(self.address.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(&self.address);
        out
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::FIXED_LEN + self.address.len());
        out.extend_from_slice(&self.transport.0.to_be_bytes());
        out.extend_from_slice(&self.mtu.to_be_bytes());
        out.extend_from_slice(&(self.address.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(self.sender.as_bytes());
        out.extend_from_slice(&self.signature);
        out.extend_from_slice(&self.address);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < Self::FIXED_LEN {
            return Err(CoreError::Wire("truncated hello"));
        }
        let transport = TransportKind(read_u16(data));
        let mtu = read_u16(&data[2..]);
        let address_size = read_u16(&data[4..]) as usize;
        let expiration = read_u32(&data[6..]);
        if data.len() != Self::FIXED_LEN + address_size {
            return Err(CoreError::Wire("hello size mismatch"));
        }
        let mut public_key = [0u8; 32];
        public_key.copy_from_slice(&data[10..42]);
        let sender = PeerId::from_slice(&data[42..42 + PeerId::LEN]);
        let mut signature = [0u8; 64];
        signature.copy_from_slice(&data[106..170]);
        Ok(Self {
            transport,
            mtu,
            expiration,
            public_key,
            sender,
            signature,
            address: data[Self::FIXED_LEN..].to_vec(),
        })
    }

    /// Checks the record invariants: identity is the hash of the key,
    /// expiration is within `[now, now + MAX_HELLO_AGE]`, and the
    /// signature verifies. Never accept an advertisement that fails
    /// any of these into the known-hosts store.
    pub fn validate(&self, identity: &dyn Identity, now_unix: u32) -> Result<(), CoreError> {
        if PeerId::from_public_key(&self.public_key) != self.sender {
            return Err(CoreError::Wire("hello identity does not match key"));
        }
        if (self.expiration as u64) < now_unix as u64
            || self.expiration as u64 > now_unix as u64 + MAX_HELLO_AGE.as_secs()
        {
            return Err(CoreError::Wire("hello expiration out of bounds"));
        }
        if !identity.verify(&self.public_key, &self.signed_bytes(), &self.signature) {
            return Err(CoreError::Identity(
                crate::identity::IdentityError::InvalidSignature,
            ));
        }
        Ok(())
    }

    /// Equality disregarding the advertised lifetime, used to decide
    /// whether a re-received advertisement is already trusted.
    pub fn same_address(&self, other: &Hello) -> bool {
        self.transport == other.transport
            && self.sender == other.sender
            && self.public_key == other.public_key
            && self.address == other.address
    }

    pub fn is_expired(&self, now_unix: u32) -> bool {
        (self.expiration as u64) < now_unix as u64
    }
}

struct StoredHello {
    hello: Hello,
    /// Connect attempts fail with exponential backoff before retrying.
    retry_after: Option<Instant>,
    backoff: Duration,
}

/// Cached advertisements from other peers, one row per peer × transport.
///
/// Optionally persisted as one file per row under the known-hosts
/// directory, named `<identity-hex>.<transport>`.
pub struct KnownHosts {
    rows: FlatMap<(PeerId, TransportKind), StoredHello>,
    dir: Option<PathBuf>,
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(60);

impl KnownHosts {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            rows: FlatMap::new(),
            dir,
        }
    }

    /// Loads persisted advertisements, skipping anything corrupt or
    /// expired. Signature validation happened before persistence.
    pub fn load(&mut self, now_unix: u32) {
        let Some(dir) = self.dir.clone() else { return };
        let Ok(entries) = fs::read_dir(&dir) else { return };
        for entry in entries.flatten() {
            let Ok(raw) = fs::read(entry.path()) else { continue };
            let Ok(hello) = Hello::decode(&raw) else {
                debug!("ignoring corrupt known-hosts file {:?}", entry.file_name());
                continue;
            };
            if hello.is_expired(now_unix) {
                let _ = fs::remove_file(entry.path());
                continue;
            }
            self.insert_row(hello);
        }
    }

    fn persist(&self, hello: &Hello) {
        let Some(dir) = &self.dir else { return };
        if fs::create_dir_all(dir).is_err() {
            return;
        }
        let name = format!("{}.{}", hello.sender.to_hex(), hello.transport.0);
        if let Err(e) = fs::write(dir.join(&name), hello.encode()) {
            warn!("failed to persist hello for {}: {e}", hello.sender);
        }
    }

    fn insert_row(&mut self, hello: Hello) {
        self.rows.insert(
            (hello.sender, hello.transport),
            StoredHello {
                hello,
                retry_after: None,
                backoff: INITIAL_BACKOFF,
            },
        );
    }

    /// Adopts a validated advertisement, replacing any older one for
    /// the same peer × transport.
    pub fn put(&mut self, hello: Hello) {
        self.persist(&hello);
        self.insert_row(hello);
    }

    pub fn get(&self, peer: &PeerId, transport: TransportKind) -> Option<&Hello> {
        self.rows.get(&(*peer, transport)).map(|row| &row.hello)
    }

    /// Is an identical advertisement (ignoring lifetime) already known?
    pub fn is_known(&self, hello: &Hello) -> bool {
        self.rows
            .get(&(hello.sender, hello.transport))
            .is_some_and(|row| row.hello.same_address(hello))
    }

    pub fn contains_peer(&self, peer: &PeerId) -> bool {
        self.rows.keys().any(|(id, _)| id == peer)
    }

    /// The usable advertisement with the lowest driver cost.
    pub fn best_for(
        &self,
        peer: &PeerId,
        now: Instant,
        now_unix: u32,
        cost: impl Fn(TransportKind) -> u32,
    ) -> Option<&Hello> {
        self.rows
            .iter()
            .filter(|((id, _), row)| {
                id == peer
                    && !row.hello.is_expired(now_unix)
                    && row.retry_after.is_none_or(|t| t <= now)
            })
            .min_by_key(|((_, kind), _)| cost(*kind))
            .map(|(_, row)| &row.hello)
    }

    /// Marks a failed connect attempt; the row is skipped until the
    /// backoff elapses, doubling on every further failure.
    pub fn report_failure(&mut self, peer: &PeerId, transport: TransportKind, now: Instant) {
        if let Some(row) = self.rows.get_mut(&(*peer, transport)) {
            row.retry_after = Some(now + row.backoff);
            row.backoff = row.backoff.saturating_mul(2);
        }
    }

    pub fn report_success(&mut self, peer: &PeerId, transport: TransportKind) {
        if let Some(row) = self.rows.get_mut(&(*peer, transport)) {
            row.retry_after = None;
            row.backoff = INITIAL_BACKOFF;
        }
    }

    pub fn remove_expired(&mut self, now_unix: u32) {
        self.rows.retain(|_, row| !row.hello.is_expired(now_unix));
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hello> {
        self.rows.values().map(|row| &row.hello)
    }

    /// Peers known over the given transport, for broadcast sampling.
    pub fn peers_on(&self, transport: TransportKind) -> Vec<PeerId> {
        self.rows
            .keys()
            .filter(|(_, kind)| *kind == transport)
            .map(|(id, _)| *id)
            .collect()
    }
}
