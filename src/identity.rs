use crate::crypto::{self, SessionKey};
use crate::time::TimeProvider;
use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey,
};
use parking_lot::Mutex;
use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Hostkey unreadable: {0}")]
    HostkeyUnreadable(String),
    #[error("Cannot wrap session key for peer")]
    KeyWrap,
}

/// 512-bit hash of a peer's public key; keys every per-peer structure.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 64]);

impl PeerId {
    pub const LEN: usize = 64;

    pub fn from_public_key(pk: &[u8; 32]) -> Self {
        let digest = Sha512::digest(pk);
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Panics if `slice` is not exactly 64 bytes; callers validate size.
    pub fn from_slice(slice: &[u8]) -> Self {
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(slice);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// First machine word, used for connection-table bucketing.
    pub fn first_word(&self) -> u64 {
        u64::from_be_bytes(self.0[..8].try_into().expect("64-byte id"))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..6]))
    }
}

/// Identity capability consumed by the core: keys, signatures and
/// the peer reputation ledgers.
pub trait Identity: Send + Sync {
    fn own_id(&self) -> PeerId;
    fn own_public_key(&self) -> [u8; 32];
    fn sign(&self, data: &[u8]) -> [u8; 64];
    fn verify(&self, public_key: &[u8; 32], data: &[u8], sig: &[u8; 64]) -> bool;

    /// Wraps a session key to the holder of `recipient_pk`.
    fn wrap_session_key(&self, recipient_pk: &[u8; 32], key: &SessionKey)
    -> Option<[u8; 32]>;
    /// Unwraps a session key sent to us by the holder of `author_pk`.
    fn unwrap_session_key(&self, author_pk: &[u8; 32], wrapped: &[u8; 32])
    -> Option<SessionKey>;

    fn blacklist(&self, id: &PeerId, duration: Duration, strict: bool);
    fn whitelist(&self, id: &PeerId);
    fn is_blacklisted(&self, id: &PeerId) -> bool;
    fn is_blacklisted_strict(&self, id: &PeerId) -> bool;

    fn change_trust(&self, id: &PeerId, delta: i32);
    fn get_trust(&self, id: &PeerId) -> u32;
}

struct BlacklistRow {
    until: Instant,
    strict: bool,
    /// Doubles on every repeated offence, like the known-hosts backoff.
    backoff: Duration,
}

/// The node's own keypair plus the peer ledgers (trust, blacklist).
///
/// The hostkey is a 32-byte Ed25519 seed persisted under the daemon
/// home; trust counters live in one small file per peer next to the
/// known-hosts records.
pub struct NodeIdentity {
    signing: SigningKey,
    dh_secret: [u8; 32],
    id: PeerId,
    time: Arc<dyn TimeProvider>,
    home: Option<PathBuf>,
    blacklist: Mutex<HashMap<PeerId, BlacklistRow>>,
    trust: Mutex<HashMap<PeerId, u32>>,
}

impl NodeIdentity {
    pub fn new(seed: [u8; 32], time: Arc<dyn TimeProvider>) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let public = signing.verifying_key().to_bytes();
        Self {
            dh_secret: crypto::ed25519_sk_to_x25519(&seed),
            id: PeerId::from_public_key(&public),
            signing,
            time,
            home: None,
            blacklist: Mutex::new(HashMap::new()),
            trust: Mutex::new(HashMap::new()),
        }
    }

    /// Loads the hostkey from `<home>/.hostkey`, creating it on first
    /// boot. An unreadable or corrupt hostkey is the one error that
    /// terminates the daemon.
    pub fn load_or_create(
        home: &std::path::Path,
        time: Arc<dyn TimeProvider>,
        rng: &mut dyn rand::RngCore,
    ) -> Result<Self, IdentityError> {
        let path = home.join(".hostkey");
        let seed: [u8; 32] = if path.exists() {
            let raw = fs::read(&path)
                .map_err(|e| IdentityError::HostkeyUnreadable(e.to_string()))?;
            raw.try_into().map_err(|_| {
                IdentityError::HostkeyUnreadable("wrong hostkey length".into())
            })?
        } else {
            let mut seed = [0u8; 32];
            rng.fill_bytes(&mut seed);
            fs::create_dir_all(home)
                .and_then(|()| fs::write(&path, seed))
                .map_err(|e| IdentityError::HostkeyUnreadable(e.to_string()))?;
            info!("generated new hostkey at {}", path.display());
            seed
        };
        let mut node = Self::new(seed, time);
        node.home = Some(home.to_path_buf());
        node.load_trust();
        Ok(node)
    }

    fn trust_path(&self) -> Option<PathBuf> {
        self.home.as_ref().map(|h| h.join("trust"))
    }

    fn load_trust(&mut self) {
        let Some(dir) = self.trust_path() else { return };
        let Ok(entries) = fs::read_dir(&dir) else { return };
        let mut trust = self.trust.lock();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(hex_name) = name.to_str() else { continue };
            let Ok(raw) = hex::decode(hex_name) else { continue };
            if raw.len() != PeerId::LEN {
                continue;
            }
            let Ok(text) = fs::read_to_string(entry.path()) else { continue };
            if let Ok(value) = text.trim().parse::<u32>() {
                trust.insert(PeerId::from_slice(&raw), value);
            }
        }
    }

    fn persist_trust(&self, id: &PeerId, value: u32) {
        let Some(dir) = self.trust_path() else { return };
        if fs::create_dir_all(&dir).is_err() {
            return;
        }
        let path = dir.join(id.to_hex());
        if let Err(e) = fs::write(&path, value.to_string()) {
            debug!("failed to persist trust for {id}: {e}");
        }
    }
}

impl Identity for NodeIdentity {
    fn own_id(&self) -> PeerId {
        self.id
    }

    fn own_public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.signing.sign(data).to_bytes()
    }

    fn verify(&self, public_key: &[u8; 32], data: &[u8], sig: &[u8; 64]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(public_key) else {
            return false;
        };
        let signature = DalekSignature::from_bytes(sig);
        key.verify(data, &signature).is_ok()
    }

    fn wrap_session_key(
        &self,
        recipient_pk: &[u8; 32],
        key: &SessionKey,
    ) -> Option<[u8; 32]> {
        crypto::wrap_session_key(
            &self.dh_secret,
            &self.signing.verifying_key().to_bytes(),
            recipient_pk,
            key,
        )
    }

    fn unwrap_session_key(
        &self,
        author_pk: &[u8; 32],
        wrapped: &[u8; 32],
    ) -> Option<SessionKey> {
        crypto::unwrap_session_key(&self.dh_secret, author_pk, wrapped)
    }

    fn blacklist(&self, id: &PeerId, duration: Duration, strict: bool) {
        let now = self.time.now_instant();
        let mut table = self.blacklist.lock();
        let row = table.entry(*id).or_insert_with(|| BlacklistRow {
            until: now,
            strict,
            backoff: duration,
        });
        if row.until > now {
            row.backoff = row.backoff.saturating_mul(2);
        } else {
            row.backoff = row.backoff.max(duration);
        }
        row.strict = row.strict || strict;
        row.until = now + row.backoff;
        warn!("blacklisted {id} for {:?} (strict: {strict})", row.backoff);
    }

    fn whitelist(&self, id: &PeerId) {
        self.blacklist.lock().remove(id);
    }

    fn is_blacklisted(&self, id: &PeerId) -> bool {
        let now = self.time.now_instant();
        let mut table = self.blacklist.lock();
        match table.get(id) {
            Some(row) if row.until > now => true,
            Some(_) => {
                table.remove(id);
                false
            }
            None => false,
        }
    }

    fn is_blacklisted_strict(&self, id: &PeerId) -> bool {
        let now = self.time.now_instant();
        self.blacklist
            .lock()
            .get(id)
            .is_some_and(|row| row.strict && row.until > now)
    }

    fn change_trust(&self, id: &PeerId, delta: i32) {
        let mut trust = self.trust.lock();
        let value = trust.entry(*id).or_insert(0);
        *value = value.saturating_add_signed(delta);
        let value = *value;
        drop(trust);
        self.persist_trust(id, value);
    }

    fn get_trust(&self, id: &PeerId) -> u32 {
        self.trust.lock().get(id).copied().unwrap_or(0)
    }
}
