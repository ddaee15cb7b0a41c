//! Certificate authority store abstraction.
//!
//! The rotation subsystem consumes the store, it does not own it: records
//! are created at cluster bootstrap by whoever provisions the cluster, and
//! every mutation made here is a compare-and-swap guarded by the record
//! fetched at the start of the transition. The store's CAS is the only
//! serialization point; there is no rotation lock.
//!
//! # Async pattern
//!
//! Trait methods return [`BoxFuture`] so the trait stays object-safe and
//! usable as `Arc<dyn CaStore>` across backends.

mod memory;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;
use trustplane_core::authority::CaValidationError;
use trustplane_core::{CertAuthority, CertAuthorityId};

pub use memory::MemoryCaStore;

/// A boxed future for async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors produced by certificate authority stores.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// No record exists for the requested authority.
    #[error("certificate authority {id} not found")]
    NotFound {
        /// Identity of the missing record.
        id: String,
    },

    /// The compare-and-swap witness no longer matches the stored record.
    #[error("certificate authority {id} was concurrently modified")]
    Conflict {
        /// Identity of the contended record.
        id: String,
    },

    /// The new record and the witness identify different authorities.
    #[error("compare-and-swap records identify different authorities: {new} vs {expected}")]
    IdentityMismatch {
        /// Identity carried by the new record.
        new: String,
        /// Identity carried by the witness.
        expected: String,
    },

    /// The record being written violates the record invariants.
    #[error(transparent)]
    Invalid(#[from] CaValidationError),

    /// Internal lock poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,
}

/// Trait defining the store operations the rotation subsystem requires.
///
/// # Object safety
///
/// The trait is object-safe and is consumed as `Arc<dyn CaStore>`.
pub trait CaStore: Send + Sync {
    /// Fetches the certificate authority identified by `id`.
    ///
    /// With `load_secrets == false` the returned record is a public-only
    /// view: no signing keys, no TLS private keys.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when no record exists.
    fn get_cert_authority<'a>(
        &'a self,
        id: &'a CertAuthorityId,
        load_secrets: bool,
    ) -> BoxFuture<'a, Result<CertAuthority, StoreError>>;

    /// Replaces the stored record with `new`, provided the stored record
    /// still matches `expected`.
    ///
    /// Callers must not retry on conflict: a conflicting writer may have
    /// driven the rotation machine into a state where the caller's target
    /// is no longer legal.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the witness is stale and
    /// [`StoreError::Invalid`] when `new` violates the record invariants.
    fn compare_and_swap_cert_authority<'a>(
        &'a self,
        new: &'a CertAuthority,
        expected: &'a CertAuthority,
    ) -> BoxFuture<'a, Result<(), StoreError>>;
}
