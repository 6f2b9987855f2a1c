//! Identity persistence boundary.

use super::Identity;
use crate::error::{Error, Result};
use std::sync::Mutex;
use tracing::info;

/// Somewhere an identity can be loaded from and saved to.
pub trait IdentityStore {
    /// Load the stored identity, if any.
    fn load(&self) -> Result<Option<Identity>>;

    /// Persist the identity, replacing any previous one.
    fn save(&self, identity: &Identity) -> Result<()>;
}

/// Volatile store, used by tests and the simulator.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    slot: Mutex<Option<Identity>>,
}

impl MemoryIdentityStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<Identity>> {
        let slot = self
            .slot
            .lock()
            .map_err(|_| Error::Storage("identity store lock poisoned".into()))?;
        Ok(slot.clone())
    }

    fn save(&self, identity: &Identity) -> Result<()> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| Error::Storage("identity store lock poisoned".into()))?;
        *slot = Some(identity.clone());
        Ok(())
    }
}

/// Load the identity from `store`, generating and saving a new one if empty.
pub fn load_or_generate<S: IdentityStore + ?Sized>(store: &S) -> Result<Identity> {
    if let Some(identity) = store.load()? {
        info!(peer_id = %identity.peer_id(), "Loaded existing identity");
        return Ok(identity);
    }

    let identity = Identity::generate();
    store.save(&identity)?;
    info!(peer_id = %identity.peer_id(), "Generated new identity");
    Ok(identity)
}
