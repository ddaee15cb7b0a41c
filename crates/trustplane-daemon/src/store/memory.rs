//! In-memory certificate authority store.
//!
//! Backs tests and single-node deployments. Every write validates the
//! record invariants, and the compare-and-swap witness is matched by value:
//! a witness fetched without secrets is compared against the stored
//! record's public-only view, so secretless readers can still CAS.

use std::collections::HashMap;
use std::sync::RwLock;

use trustplane_core::{CertAuthority, CertAuthorityId};

use super::{BoxFuture, CaStore, StoreError};

/// Certificate authority store backed by a process-local map.
#[derive(Debug, Default)]
pub struct MemoryCaStore {
    records: RwLock<HashMap<CertAuthorityId, CertAuthority>>,
}

impl MemoryCaStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record, replacing any existing one.
    ///
    /// Record creation belongs to cluster bootstrap, not to the rotation
    /// subsystem, which is why this lives on the concrete store rather
    /// than on [`CaStore`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Invalid`] when the record violates the
    /// record invariants.
    pub fn insert(&self, ca: CertAuthority) -> Result<(), StoreError> {
        ca.validate()?;
        let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
        records.insert(ca.id(), ca);
        Ok(())
    }
}

impl CaStore for MemoryCaStore {
    fn get_cert_authority<'a>(
        &'a self,
        id: &'a CertAuthorityId,
        load_secrets: bool,
    ) -> BoxFuture<'a, Result<CertAuthority, StoreError>> {
        Box::pin(async move {
            let records = self.records.read().map_err(|_| StoreError::LockPoisoned)?;
            let ca = records.get(id).ok_or_else(|| StoreError::NotFound {
                id: id.to_string(),
            })?;
            Ok(if load_secrets {
                ca.clone()
            } else {
                ca.without_secrets()
            })
        })
    }

    fn compare_and_swap_cert_authority<'a>(
        &'a self,
        new: &'a CertAuthority,
        expected: &'a CertAuthority,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let id = new.id();
            if id != expected.id() {
                return Err(StoreError::IdentityMismatch {
                    new: id.to_string(),
                    expected: expected.id().to_string(),
                });
            }
            new.validate()?;

            let mut records = self.records.write().map_err(|_| StoreError::LockPoisoned)?;
            let stored = records.get(&id).ok_or_else(|| StoreError::NotFound {
                id: id.to_string(),
            })?;

            // A witness without signing keys came from a secretless read;
            // match it against the stored record's public view.
            let matches = if expected.signing_keys().is_empty() {
                stored.without_secrets() == *expected
            } else {
                stored == expected
            };
            if !matches {
                return Err(StoreError::Conflict { id: id.to_string() });
            }

            records.insert(id, new.clone());
            Ok(())
        })
    }
}
