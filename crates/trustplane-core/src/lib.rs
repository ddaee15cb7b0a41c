//! # trustplane-core
//!
//! Core domain model for trustplane, a cluster certificate-authority
//! rotation subsystem. The cluster carries two internal trust roots, one
//! for host identities and one for user identities; this crate models
//! their records and the state machine that rotates their key material
//! without disrupting a running fleet.
//!
//! ## Components
//!
//! - **Authority records** ([`authority`]): the CA record with its
//!   parallel signing/checking/TLS key sequences and the rotation
//!   descriptor, plus the pure transition engine.
//! - **Key generation** ([`keygen`]): the trait seam minting fresh SSH
//!   keypairs and self-signed TLS CAs when a rotation starts.
//! - **Clock** ([`clock`]): injectable time source keeping schedule
//!   decisions deterministic under test.
//!
//! Persistence, request normalization and the scheduled worker live in
//! `trustplane-daemon`.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod authority;
pub mod clock;
pub mod keygen;

pub use authority::{
    process_rotation, CaKind, CertAuthority, CertAuthorityId, Rotation, RotationError,
    RotationMode, RotationPhase, RotationSchedule, RotationState, TlsKeyPair, TransitionRequest,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use keygen::{KeyMaterialGenerator, NativeKeyMaterialGenerator};
