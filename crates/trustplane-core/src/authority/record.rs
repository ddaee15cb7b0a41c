//! The certificate authority record.
//!
//! A record holds the active and trusted key material for one identity
//! class (host or user) within one cluster, plus the rotation descriptor.
//! Records are created at cluster bootstrap and from then on only updated,
//! always through a read-clone-mutate-CAS cycle: the clone returned by
//! [`Clone::clone`] is deep, so the original can serve unchanged as the
//! compare-and-swap witness.
//!
//! # Key sequence convention
//!
//! The three sequences (`signing_keys`, `checking_keys`, `tls_key_pairs`)
//! are parallel. Index 0 is always the active material; any further entries
//! are retired but still trusted for verification. In standby the sequences
//! have length 1; in the staged phases exactly 2; during rollback the SSH
//! sequences are back to 1 while the TLS sequence keeps the attempted
//! certificate as trusted. The `active_*` accessors encapsulate that
//! discipline and [`CertAuthority::validate`] enforces it at the store
//! boundary.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::{Rotation, RotationPhase, RotationState};

/// Identity class a certificate authority vouches for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaKind {
    /// Host identities: servers, proxies and other cluster components.
    Host,
    /// User identities.
    User,
}

impl CaKind {
    /// Both kinds, in rotation fan-out order.
    pub const ALL: [Self; 2] = [Self::Host, Self::User];

    /// Returns the kind as its wire string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::User => "user",
        }
    }
}

impl fmt::Display for CaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown certificate authority kind supplied at the RPC boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported certificate authority kind: {kind:?}")]
pub struct UnsupportedKindError {
    /// The rejected input.
    pub kind: String,
}

impl FromStr for CaKind {
    type Err = UnsupportedKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Self::Host),
            "user" => Ok(Self::User),
            other => Err(UnsupportedKindError {
                kind: other.to_string(),
            }),
        }
    }
}

/// Store identity of a certificate authority record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertAuthorityId {
    /// Identity class.
    pub kind: CaKind,
    /// Cluster the authority belongs to.
    pub cluster_name: String,
}

impl fmt::Display for CertAuthorityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.cluster_name)
    }
}

/// A TLS certificate plus, when this side may sign, its private key.
///
/// An entry with `key: None` is trusted for verification but cannot issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsKeyPair {
    /// PEM-encoded certificate.
    pub cert: String,
    /// PEM-encoded private key, absent on trusted-only entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl TlsKeyPair {
    /// Returns a copy with the private key dropped.
    #[must_use]
    pub fn trusted_only(&self) -> Self {
        Self {
            cert: self.cert.clone(),
            key: None,
        }
    }

    /// Returns `true` when the pair can issue certificates.
    #[must_use]
    pub const fn can_sign(&self) -> bool {
        self.key.is_some()
    }
}

/// Violations of the record invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CaValidationError {
    /// The record carries no cluster name.
    #[error("certificate authority cluster name must not be empty")]
    EmptyClusterName,

    /// A key sequence that must never be empty is empty.
    #[error("certificate authority must hold at least one entry in {field}")]
    EmptyKeySet {
        /// The offending sequence.
        field: &'static str,
    },

    /// The signing and checking sequences are no longer parallel.
    #[error("signing and checking key counts diverge: {signing} != {checking}")]
    KeyCountMismatch {
        /// Number of signing keys.
        signing: usize,
        /// Number of checking keys.
        checking: usize,
    },

    /// A key sequence length does not match the rotation phase.
    #[error("{field} holds {count} entries, rotation phase {phase} requires {required}")]
    PhaseKeyCount {
        /// The offending sequence.
        field: &'static str,
        /// Phase the record claims to be in.
        phase: RotationPhase,
        /// Entries the phase requires.
        required: usize,
        /// Entries actually present.
        count: usize,
    },

    /// A standby rotation descriptor still carries in-progress fields.
    #[error("standby rotation descriptor still carries {field}")]
    StandbyResidue {
        /// The field that should have been cleared.
        field: &'static str,
    },

    /// An in-progress rotation descriptor sits in the standby phase.
    #[error("in-progress rotation descriptor cannot be in the standby phase")]
    InProgressStandbyPhase,
}

/// A certificate authority record.
///
/// Field access goes through getters and setters; the sequences are
/// replaced wholesale by the transition engine rather than edited in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CertAuthority {
    kind: CaKind,
    cluster_name: String,
    signing_keys: Vec<String>,
    checking_keys: Vec<String>,
    tls_key_pairs: Vec<TlsKeyPair>,
    #[serde(default)]
    rotation: Rotation,
}

impl CertAuthority {
    /// Creates a bootstrap record holding a single active key set and a
    /// standby rotation descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`CaValidationError`] if the material is incomplete.
    pub fn new(
        kind: CaKind,
        cluster_name: impl Into<String>,
        signing_key: String,
        checking_key: String,
        tls_key_pair: TlsKeyPair,
    ) -> Result<Self, CaValidationError> {
        let ca = Self {
            kind,
            cluster_name: cluster_name.into(),
            signing_keys: vec![signing_key],
            checking_keys: vec![checking_key],
            tls_key_pairs: vec![tls_key_pair],
            rotation: Rotation::default(),
        };
        ca.validate()?;
        Ok(ca)
    }

    /// Returns the identity class.
    #[must_use]
    pub const fn kind(&self) -> CaKind {
        self.kind
    }

    /// Returns the cluster name.
    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Returns the store identity of this record.
    #[must_use]
    pub fn id(&self) -> CertAuthorityId {
        CertAuthorityId {
            kind: self.kind,
            cluster_name: self.cluster_name.clone(),
        }
    }

    /// Returns the private signing keys, active first.
    #[must_use]
    pub fn signing_keys(&self) -> &[String] {
        &self.signing_keys
    }

    /// Replaces the private signing keys.
    pub fn set_signing_keys(&mut self, keys: Vec<String>) {
        self.signing_keys = keys;
    }

    /// Returns the public checking keys, active first.
    #[must_use]
    pub fn checking_keys(&self) -> &[String] {
        &self.checking_keys
    }

    /// Replaces the public checking keys.
    pub fn set_checking_keys(&mut self, keys: Vec<String>) {
        self.checking_keys = keys;
    }

    /// Returns the TLS key pairs, active first.
    #[must_use]
    pub fn tls_key_pairs(&self) -> &[TlsKeyPair] {
        &self.tls_key_pairs
    }

    /// Replaces the TLS key pairs.
    pub fn set_tls_key_pairs(&mut self, pairs: Vec<TlsKeyPair>) {
        self.tls_key_pairs = pairs;
    }

    /// Returns the rotation descriptor.
    #[must_use]
    pub const fn rotation(&self) -> &Rotation {
        &self.rotation
    }

    /// Replaces the rotation descriptor.
    pub fn set_rotation(&mut self, rotation: Rotation) {
        self.rotation = rotation;
    }

    /// Returns the key currently used to sign new credentials, if the
    /// record was loaded with secrets.
    #[must_use]
    pub fn active_signing_key(&self) -> Option<&str> {
        self.signing_keys.first().map(String::as_str)
    }

    /// Returns the public key matching the active signer.
    #[must_use]
    pub fn active_checking_key(&self) -> Option<&str> {
        self.checking_keys.first().map(String::as_str)
    }

    /// Returns the TLS pair currently used to issue certificates.
    #[must_use]
    pub fn active_tls_key_pair(&self) -> Option<&TlsKeyPair> {
        self.tls_key_pairs.first()
    }

    /// Returns the retired-but-trusted checking keys, if any.
    #[must_use]
    pub fn trusted_checking_keys(&self) -> &[String] {
        self.checking_keys.get(1..).unwrap_or_default()
    }

    /// Returns a public-only view of this record: signing keys are dropped
    /// and TLS private keys cleared. The view is what trusted peers and
    /// secretless readers observe.
    #[must_use]
    pub fn without_secrets(&self) -> Self {
        let mut ca = self.clone();
        ca.signing_keys.clear();
        for pair in &mut ca.tls_key_pairs {
            pair.key = None;
        }
        ca
    }

    /// Checks the record invariants.
    ///
    /// Public-only views (no signing keys at all) skip the signing-side
    /// checks; everything else is enforced on both the checking-key and
    /// TLS sequences so that replicas of remote authorities stay honest
    /// about their rotation state.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), CaValidationError> {
        if self.cluster_name.is_empty() {
            return Err(CaValidationError::EmptyClusterName);
        }
        if self.checking_keys.is_empty() {
            return Err(CaValidationError::EmptyKeySet {
                field: "checking_keys",
            });
        }
        if self.tls_key_pairs.is_empty() {
            return Err(CaValidationError::EmptyKeySet {
                field: "tls_key_pairs",
            });
        }
        if !self.signing_keys.is_empty() && self.signing_keys.len() != self.checking_keys.len() {
            return Err(CaValidationError::KeyCountMismatch {
                signing: self.signing_keys.len(),
                checking: self.checking_keys.len(),
            });
        }

        let phase = self.rotation.phase;
        match self.rotation.state {
            RotationState::Standby => {
                if phase != RotationPhase::Standby {
                    return Err(CaValidationError::StandbyResidue { field: "phase" });
                }
                if self.rotation.mode.is_some() {
                    return Err(CaValidationError::StandbyResidue { field: "mode" });
                }
                if self.rotation.started.is_some() {
                    return Err(CaValidationError::StandbyResidue { field: "started" });
                }
                if self.rotation.schedule.is_some() {
                    return Err(CaValidationError::StandbyResidue { field: "schedule" });
                }
                self.check_sequence_lengths(phase, 1, 1)?;
            },
            RotationState::InProgress => {
                // During rollback the old material is already back in the
                // sole active slot; only the TLS sequence keeps the
                // attempted certificate around as trusted.
                match phase {
                    RotationPhase::Standby => {
                        return Err(CaValidationError::InProgressStandbyPhase);
                    },
                    RotationPhase::UpdateClients | RotationPhase::UpdateServers => {
                        self.check_sequence_lengths(phase, 2, 2)?;
                    },
                    RotationPhase::Rollback => {
                        self.check_sequence_lengths(phase, 1, 2)?;
                    },
                }
            },
        }

        Ok(())
    }

    /// Checks the per-phase key-sequence lengths.
    fn check_sequence_lengths(
        &self,
        phase: RotationPhase,
        ssh_required: usize,
        tls_required: usize,
    ) -> Result<(), CaValidationError> {
        if self.checking_keys.len() != ssh_required {
            return Err(CaValidationError::PhaseKeyCount {
                field: "checking_keys",
                phase,
                required: ssh_required,
                count: self.checking_keys.len(),
            });
        }
        if self.tls_key_pairs.len() != tls_required {
            return Err(CaValidationError::PhaseKeyCount {
                field: "tls_key_pairs",
                phase,
                required: tls_required,
                count: self.tls_key_pairs.len(),
            });
        }
        Ok(())
    }
}
