use crate::error::CoreError;
use crate::protocol::MAC_LEN;
use chacha20::ChaCha20;
use chacha20::cipher::{KeyIvInit, StreamCipher};
use curve25519_dalek::edwards::CompressedEdwardsY;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

/// Symmetric key of one direction of a session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; 32]);

impl SessionKey {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn random(rng: &mut dyn rand::RngCore) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Keys are overwritten when a session drops to DOWN.
    pub fn zeroize(&mut self) {
        self.0 = [0u8; 32];
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionKey(..)")
    }
}

/// Sha512 over `data`, the frame hash-MAC.
pub fn hash_mac(data: &[u8]) -> [u8; MAC_LEN] {
    let digest = Sha512::digest(data);
    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&digest);
    out
}

fn frame_cipher(key: &SessionKey, mac: &[u8; MAC_LEN]) -> ChaCha20 {
    let mut iv = [0u8; 12];
    iv.copy_from_slice(&mac[..12]);
    ChaCha20::new(key.as_bytes().into(), &iv.into())
}

/// Seals a plaintext frame in place: writes the MAC of `[MAC_LEN..]`
/// into the MAC field and encrypts `[MAC_LEN..]` under `key` with the
/// MAC prefix as IV.
pub fn seal_frame(key: &SessionKey, frame: &mut [u8]) {
    debug_assert!(frame.len() > MAC_LEN);
    let mac = hash_mac(&frame[MAC_LEN..]);
    frame[..MAC_LEN].copy_from_slice(&mac);
    frame_cipher(key, &mac).apply_keystream(&mut frame[MAC_LEN..]);
}

/// Opens a sealed frame in place; on success `[MAC_LEN..]` holds the
/// plaintext body. Constant-time MAC comparison.
pub fn open_frame(key: &SessionKey, frame: &mut [u8]) -> Result<(), CoreError> {
    if frame.len() <= MAC_LEN {
        return Err(CoreError::Wire("frame shorter than MAC"));
    }
    let mut mac = [0u8; MAC_LEN];
    mac.copy_from_slice(&frame[..MAC_LEN]);
    frame_cipher(key, &mac).apply_keystream(&mut frame[MAC_LEN..]);
    let computed = hash_mac(&frame[MAC_LEN..]);
    if bool::from(computed.ct_eq(&mac)) {
        Ok(())
    } else {
        Err(CoreError::DecryptFailed)
    }
}

/// True iff the frame is a detectable plaintext frame: MAC equals the
/// hash of the body and every other header field is zero.
pub fn is_plaintext_frame(frame: &[u8]) -> bool {
    if frame.len() <= crate::protocol::PACKET_HEADER_LEN {
        return false;
    }
    let trailer = &frame[MAC_LEN..crate::protocol::PACKET_HEADER_LEN];
    if trailer.iter().any(|&b| b != 0) {
        return false;
    }
    let computed = hash_mac(&frame[crate::protocol::PACKET_HEADER_LEN..]);
    bool::from(computed.ct_eq(&frame[..MAC_LEN]))
}

/// Converts an Ed25519 public key to an X25519 public key so session
/// keys can be wrapped to a peer's advertised identity key.
pub fn ed25519_pk_to_x25519(ed_pk: &[u8; 32]) -> Option<XPublicKey> {
    let ed_point = CompressedEdwardsY(*ed_pk).decompress()?;
    Some(XPublicKey::from(ed_point.to_montgomery().0))
}

/// Converts an Ed25519 secret seed to an X25519 scalar (RFC 8032
/// expansion plus clamping).
pub fn ed25519_sk_to_x25519(ed_sk: &[u8; 32]) -> [u8; 32] {
    let hash = Sha512::digest(ed_sk);
    let mut x_sk = [0u8; 32];
    x_sk.copy_from_slice(&hash[0..32]);
    x_sk[0] &= 248;
    x_sk[31] &= 127;
    x_sk[31] |= 64;
    x_sk
}

/// The nonce is taken from the wrapping side's public key so the two
/// directions of a crossed exchange never share a keystream.
fn wrap_cipher(self_dh_sk: &[u8; 32], other_pk: &XPublicKey, author_ed_pk: &[u8; 32]) -> ChaCha20 {
    let secret = StaticSecret::from(*self_dh_sk);
    let shared = secret.diffie_hellman(other_pk);
    let k_wrap = blake3::derive_key("veil v1 key-wrap", shared.as_bytes());
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&author_ed_pk[..12]);
    ChaCha20::new(&k_wrap.into(), &nonce.into())
}

/// Wraps a session key for a recipient identified by an Ed25519 key.
pub fn wrap_session_key(
    self_dh_sk: &[u8; 32],
    self_ed_pk: &[u8; 32],
    recipient_ed_pk: &[u8; 32],
    key: &SessionKey,
) -> Option<[u8; 32]> {
    let recipient = ed25519_pk_to_x25519(recipient_ed_pk)?;
    let mut payload = *key.as_bytes();
    wrap_cipher(self_dh_sk, &recipient, self_ed_pk).apply_keystream(&mut payload);
    Some(payload)
}

/// Unwraps a session key sent to us by the holder of `author_ed_pk`.
pub fn unwrap_session_key(
    self_dh_sk: &[u8; 32],
    author_ed_pk: &[u8; 32],
    wrapped: &[u8; 32],
) -> Option<SessionKey> {
    let author = ed25519_pk_to_x25519(author_ed_pk)?;
    let mut payload = *wrapped;
    wrap_cipher(self_dh_sk, &author, author_ed_pk).apply_keystream(&mut payload);
    Some(SessionKey::from_bytes(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn seal_open_roundtrip() {
        let mut rng = StdRng::seed_from_u64(7);
        let key = SessionKey::random(&mut rng);
        let mut frame = vec![0u8; MAC_LEN + 32];
        frame[MAC_LEN..].copy_from_slice(&[0x55; 32]);
        seal_frame(&key, &mut frame);
        assert_ne!(&frame[MAC_LEN..], &[0x55; 32][..]);
        open_frame(&key, &mut frame).unwrap();
        assert_eq!(&frame[MAC_LEN..], &[0x55; 32][..]);
    }

    #[test]
    fn open_rejects_wrong_key() {
        let mut rng = StdRng::seed_from_u64(7);
        let key = SessionKey::random(&mut rng);
        let other = SessionKey::random(&mut rng);
        let mut frame = vec![1u8; MAC_LEN + 16];
        seal_frame(&key, &mut frame);
        assert!(open_frame(&other, &mut frame).is_err());
    }
}
