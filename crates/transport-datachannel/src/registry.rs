use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::error::{PeerError, Result};
use crate::handle::Handle;
use crate::state::ConnectionState;

static REGISTRY: Lazy<HandleRegistry> = Lazy::new(HandleRegistry::new);

/// The process-wide registry consulted by the engine callbacks.
pub fn registry() -> &'static HandleRegistry {
    &REGISTRY
}

/// Maps engine handles back to the connection state that owns them.
///
/// Every operation takes the lock only for the map access itself, so callers
/// on engine threads never wait behind anything slower than a hash lookup.
#[derive(Default)]
pub struct HandleRegistry {
    entries: RwLock<HashMap<Handle, Arc<ConnectionState>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `state` under `handle`. A live entry is never overwritten.
    pub fn register(&self, handle: Handle, state: Arc<ConnectionState>) -> Result<()> {
        let mut guard = self.entries.write();
        if guard.contains_key(&handle) {
            error!(target: "datachannel", %handle, "handle already registered");
            return Err(PeerError::HandleInUse(handle));
        }
        guard.insert(handle, state);
        debug!(target: "datachannel", %handle, "handle registered");
        Ok(())
    }

    pub fn lookup(&self, handle: Handle) -> Option<Arc<ConnectionState>> {
        self.entries.read().get(&handle).cloned()
    }

    pub fn unregister(&self, handle: Handle) -> Option<Arc<ConnectionState>> {
        let removed = self.entries.write().remove(&handle);
        if removed.is_some() {
            debug!(target: "datachannel", %handle, "handle unregistered");
        }
        removed
    }

    /// Remove `handle` only while it still belongs to `owner`.
    pub fn unregister_owned(&self, handle: Handle, owner: &Arc<ConnectionState>) -> bool {
        let mut guard = self.entries.write();
        match guard.get(&handle) {
            Some(current) if Arc::ptr_eq(current, owner) => {
                guard.remove(&handle);
                debug!(target: "datachannel", %handle, "handle unregistered");
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.read().contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackEngine;
    use parking_lot::Mutex;
    use test_timeout::timeout;

    fn state() -> Arc<ConnectionState> {
        Arc::new(ConnectionState::new(Arc::new(LoopbackEngine::new())))
    }

    #[test]
    fn register_lookup_unregister() {
        let registry = HandleRegistry::new();
        let state = state();
        registry.register(Handle(1), Arc::clone(&state)).unwrap();
        let found = registry.lookup(Handle(1)).expect("registered");
        assert!(Arc::ptr_eq(&found, &state));

        assert!(registry.unregister(Handle(1)).is_some());
        assert!(registry.lookup(Handle(1)).is_none());
        assert!(registry.unregister(Handle(1)).is_none());
    }

    #[test]
    fn refuses_to_overwrite_live_entry() {
        let registry = HandleRegistry::new();
        let first = state();
        registry.register(Handle(5), Arc::clone(&first)).unwrap();
        let err = registry.register(Handle(5), state()).unwrap_err();
        assert!(matches!(err, PeerError::HandleInUse(Handle(5))));
        assert!(Arc::ptr_eq(&registry.lookup(Handle(5)).unwrap(), &first));
    }

    #[test]
    fn reused_value_resolves_to_new_owner() {
        let registry = HandleRegistry::new();
        let old = state();
        let new = state();
        registry.register(Handle(2), Arc::clone(&old)).unwrap();
        registry.unregister(Handle(2));
        registry.register(Handle(2), Arc::clone(&new)).unwrap();
        assert!(Arc::ptr_eq(&registry.lookup(Handle(2)).unwrap(), &new));
    }

    #[test]
    fn owned_unregister_leaves_foreign_entries() {
        let registry = HandleRegistry::new();
        let owner = state();
        let stranger = state();
        registry.register(Handle(8), Arc::clone(&stranger)).unwrap();
        assert!(!registry.unregister_owned(Handle(8), &owner));
        assert!(registry.contains(Handle(8)));
        assert!(registry.unregister_owned(Handle(8), &stranger));
        assert!(!registry.contains(Handle(8)));
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn events_use_the_datachannel_target() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();

        let registry = HandleRegistry::new();
        tracing::subscriber::with_default(subscriber, || {
            registry.register(Handle(70), state()).unwrap();
            registry.unregister(Handle(70));
        });

        let output = String::from_utf8(log.0.lock().clone()).unwrap();
        assert!(output.contains(" datachannel: handle registered"), "{output}");
        assert!(output.contains(" datachannel: handle unregistered"), "{output}");
        assert!(!output.contains("transport_datachannel"), "{output}");
    }

    #[test]
    fn one_state_under_connection_and_channel() {
        let registry = HandleRegistry::new();
        let state = state();
        registry.register(Handle(10), Arc::clone(&state)).unwrap();
        registry.register(Handle(11), Arc::clone(&state)).unwrap();
        assert_eq!(registry.len(), 2);
        assert!(Arc::ptr_eq(
            &registry.lookup(Handle(10)).unwrap(),
            &registry.lookup(Handle(11)).unwrap()
        ));
    }

    #[timeout(10)]
    fn concurrent_lookups_during_churn() {
        let registry = Arc::new(HandleRegistry::new());
        let shared = state();
        let writers: Vec<_> = (0..4)
            .map(|worker| {
                let registry = Arc::clone(&registry);
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for round in 0..500 {
                        let handle = Handle(worker * 1_000 + round);
                        registry.register(handle, Arc::clone(&shared)).unwrap();
                        assert!(registry.lookup(handle).is_some());
                        registry.unregister(handle);
                    }
                })
            })
            .collect();
        let reader = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for round in 0..2_000 {
                    let _ = registry.lookup(Handle(round % 4_000));
                }
            })
        };
        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();
        assert!(registry.is_empty());
    }
}
