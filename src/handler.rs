use crate::error::CoreResult;
use crate::flat_map::FlatMap;
use crate::identity::PeerId;
use crate::protocol::MessageKind;
use crate::transport::TransportSession;
use std::sync::Arc;
use tracing::debug;

/// Handler for one part of a decrypted frame. Returning an error
/// aborts the remaining parts of the same frame, nothing more.
pub type PartHandler = Arc<dyn Fn(&PeerId, &[u8]) -> CoreResult<()> + Send + Sync>;

/// Plaintext parts additionally see the transport session they arrived
/// on, so handshake handlers can answer over a unidirectional link.
pub type PlaintextHandler =
    Arc<dyn Fn(&PeerId, Option<TransportSession>, &[u8]) -> CoreResult<()> + Send + Sync>;

/// Padding callback: may write into the spare frame space and returns
/// how many bytes it used (0 to decline).
pub type PaddingCallback = Arc<dyn Fn(&PeerId, &mut [u8]) -> usize + Send + Sync>;

/// Observes every part of a successfully transmitted frame.
pub type SendObserver = Arc<dyn Fn(&PeerId, MessageKind, &[u8]) + Send + Sync>;

/// Token returned by registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

/// The callback registries binding application modules to the core.
///
/// Handler chains per message kind run in series; chains are tiny so
/// the flat maps stay cache-friendly.
pub struct HandlerRegistry {
    next_id: u64,
    encrypted: FlatMap<MessageKind, Vec<(HandlerId, PartHandler)>>,
    plaintext: FlatMap<MessageKind, Vec<(HandlerId, PlaintextHandler)>>,
    padding: Vec<(HandlerId, usize, PaddingCallback)>,
    observers: Vec<(HandlerId, SendObserver)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            encrypted: FlatMap::new(),
            plaintext: FlatMap::new(),
            padding: Vec::new(),
            observers: Vec::new(),
        }
    }

    fn next_id(&mut self) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn register_encrypted(&mut self, kind: MessageKind, handler: PartHandler) -> HandlerId {
        let id = self.next_id();
        self.encrypted.entry(kind).push((id, handler));
        debug!("registered encrypted handler for kind {kind}");
        id
    }

    pub fn register_plaintext(
        &mut self,
        kind: MessageKind,
        handler: PlaintextHandler,
    ) -> HandlerId {
        let id = self.next_id();
        self.plaintext.entry(kind).push((id, handler));
        debug!("registered plaintext handler for kind {kind}");
        id
    }

    pub fn unregister(&mut self, id: HandlerId) {
        self.encrypted
            .iter_mut()
            .for_each(|(_, chain)| chain.retain(|(h, _)| *h != id));
        self.plaintext
            .iter_mut()
            .for_each(|(_, chain)| chain.retain(|(h, _)| *h != id));
        self.padding.retain(|(h, _, _)| *h != id);
        self.observers.retain(|(h, _)| *h != id);
    }

    /// Registers a padding source; `min_padding` is the smallest spare
    /// space the callback can make use of.
    pub fn register_send_callback(
        &mut self,
        min_padding: usize,
        callback: PaddingCallback,
    ) -> HandlerId {
        let id = self.next_id();
        self.padding.push((id, min_padding, callback));
        id
    }

    pub fn register_send_notify(&mut self, observer: SendObserver) -> HandlerId {
        let id = self.next_id();
        self.observers.push((id, observer));
        id
    }

    pub fn encrypted_chain(&self, kind: MessageKind) -> &[(HandlerId, PartHandler)] {
        self.encrypted.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn plaintext_chain(&self, kind: MessageKind) -> &[(HandlerId, PlaintextHandler)] {
        self.plaintext.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn padding_callbacks(&self) -> &[(HandlerId, usize, PaddingCallback)] {
        &self.padding
    }

    pub fn observers(&self) -> &[(HandlerId, SendObserver)] {
        &self.observers
    }

    pub fn smallest_padding_need(&self) -> Option<usize> {
        self.padding.iter().map(|(_, min, _)| *min).min()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
