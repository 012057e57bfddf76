//! Public key store.
//!
//! Maps peer names to their RSA public keys. Only names present in the
//! server's store can be authenticated; everything else is dropped at the
//! envelope layer.

use std::collections::HashMap;

use rsa::RsaPublicKey;
use tokio::sync::RwLock;

use crate::error::{LanscoutError, Result};

/// Concurrent name → public key map. Readers proceed in parallel, writers
/// are exclusive.
#[derive(Debug, Default)]
pub struct PubKeys {
    keys: RwLock<HashMap<String, RsaPublicKey>>,
}

impl PubKeys {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the public key stored under `name`.
    pub async fn get(&self, name: &str) -> Result<RsaPublicKey> {
        let keys = self.keys.read().await;
        keys.get(name).cloned().ok_or(LanscoutError::KeyNotFound)
    }

    /// Stores `key` under `name`, replacing any previous entry.
    pub async fn put(&self, name: impl Into<String>, key: RsaPublicKey) {
        let mut keys = self.keys.write().await;
        keys.insert(name.into(), key);
    }

    /// Removes the entry for `name`.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let mut keys = self.keys.write().await;
        keys.remove(name)
            .map(|_| ())
            .ok_or(LanscoutError::KeyNotFound)
    }
}
