//! Command dispatch table.

use arrayvec::ArrayVec;
use snafu::ensure;

use crate::node::Transmitter;
use crate::peripheral::Peripheral;
use crate::types::{DuplicateKeySnafu, Error, IntoKey, Key, RegistryFullSnafu};

/// Number of handlers a [`Registry`] can hold.
pub const MAX_HANDLERS: usize = 16;

/// A command implementation, bound to a key in the [`Registry`].
pub trait Handler<P: Peripheral> {
    /// Called with the frame body, everything after the first `:`.
    ///
    /// A reply may be sent with `tx`. Sending anything makes the node restart
    /// reception, dropping whatever followed this frame in the receive buffer.
    fn handle(&mut self, body: &[u8], tx: &mut Transmitter<'_, P>);
}

/// Fixed-capacity map from keys to handlers.
pub struct Registry<'a, P: Peripheral> {
    entries: ArrayVec<(Key, &'a mut dyn Handler<P>), MAX_HANDLERS>,
}

impl<'a, P: Peripheral> Registry<'a, P> {
    pub fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
        }
    }

    /// Bind `handler` to `key`.
    /// # Errors
    /// [`Error::InvalidKey`], [`Error::DuplicateKey`] or [`Error::RegistryFull`].
    /// The registry is left unchanged on error.
    pub fn register(
        &mut self,
        key: impl IntoKey,
        handler: &'a mut dyn Handler<P>,
    ) -> Result<(), Error> {
        let key = key.into_key()?;
        ensure!(self.lookup(&key).is_none(), DuplicateKeySnafu);
        ensure!(!self.entries.is_full(), RegistryFullSnafu);
        self.entries.push((key, handler));
        Ok(())
    }

    /// Find the handler for a raw key taken from a frame.
    pub fn lookup(&mut self, key: &[u8]) -> Option<&mut (dyn Handler<P> + 'a)> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k.as_bytes() == key)
            .map(|(_, handler)| &mut **handler)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<P: Peripheral> Default for Registry<'_, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Peripheral> core::fmt::Debug for Registry<'_, P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(key, _)| key))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullLink;

    impl Peripheral for NullLink {
        fn start_receive(&mut self, _buffer: &mut [u8]) {}
        fn restart_receive(&mut self) {}
        fn stop_receive(&mut self) {}
        fn transmit_bytes(&mut self, _data: &[u8]) {}
    }

    #[derive(Default)]
    struct Counter(usize);

    impl Handler<NullLink> for Counter {
        fn handle(&mut self, _body: &[u8], _tx: &mut Transmitter<'_, NullLink>) {
            self.0 += 1;
        }
    }

    #[test]
    fn test_register() {
        let (mut a, mut dup, mut long, mut b) = (
            Counter::default(),
            Counter::default(),
            Counter::default(),
            Counter::default(),
        );
        let mut registry = Registry::<NullLink>::new();

        assert!(registry.register("a", &mut a).is_ok());
        assert_eq!(registry.register("a", &mut dup), Err(Error::DuplicateKey));
        assert_eq!(registry.register("too_long", &mut long), Err(Error::InvalidKey));
        assert!(registry.register("b", &mut b).is_ok());
        assert_eq!(registry.len(), 2);

        assert!(registry.lookup(b"a").is_some());
        assert!(registry.lookup(b"b").is_some());
        assert!(registry.lookup(b"c").is_none());
        assert!(registry.lookup(b"").is_none());

        let mut tx_link = NullLink;
        let mut tx = Transmitter::new(&mut tx_link);
        if let Some(handler) = registry.lookup(b"b") {
            handler.handle(b"body", &mut tx);
        }
        drop(registry);
        assert_eq!((a.0, b.0), (0, 1));
    }

    #[test]
    fn test_registry_full() {
        let mut counters: Vec<Counter> = (0..=MAX_HANDLERS).map(|_| Counter::default()).collect();
        let mut registry = Registry::<NullLink>::new();
        let keys: Vec<String> = (0..=MAX_HANDLERS).map(|i| format!("k{}", i)).collect();

        let mut results = Vec::new();
        for (key, counter) in keys.iter().zip(counters.iter_mut()) {
            results.push(registry.register(key.as_str(), counter));
        }
        assert!(results[..MAX_HANDLERS].iter().all(Result::is_ok));
        assert_eq!(results[MAX_HANDLERS], Err(Error::RegistryFull));
        assert_eq!(registry.len(), MAX_HANDLERS);
        assert!(registry.lookup(b"k16").is_none());
        assert!(registry.lookup(b"k15").is_some());
    }
}
