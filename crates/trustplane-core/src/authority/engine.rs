//! The rotation transition engine.
//!
//! [`process_rotation`] maps `(current record, request)` to the next record,
//! enforcing the legal phase transitions and rewriting the key sequences.
//! It is a pure function over its inputs apart from key-material generation;
//! persistence, fan-out and scheduling live in the daemon crate.
//!
//! # Rotation procedure
//!
//! The machine has two states, `standby` and `in_progress`, and traverses
//! the in-progress phases over a grace period so that old and new
//! credentials overlap:
//!
//! * `update_clients` — a new CA is issued and becomes the active signer.
//!   Clients reconnect and receive credentials from the new CA while
//!   servers keep presenting old ones; both CAs are trusted, so nothing
//!   breaks in either direction. Without this phase, clients holding only
//!   the old trust root could not validate servers that switched early.
//!
//! * `update_servers` — a pure signal: components reload and present the
//!   new credentials on their server endpoints too. The old CA stays
//!   trusted so components that have not reloaded remain visible.
//!
//! * `rollback` — reverts the active signer to the old CA while keeping
//!   the attempted certificate trusted, so components that already took
//!   the new credentials can still connect until they reload. Entering
//!   rollback always forces manual mode.
//!
//! * Completing to `standby` from `update_servers` drops the old CA from
//!   the trust set; completing from `rollback` discards the attempted CA.
//!
//! A zero grace period collapses the whole procedure into one step: the
//! key sequences are replaced outright and no trust in the old material is
//! retained.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use super::record::CertAuthority;
use super::state::{RotationMode, RotationPhase, RotationSchedule, RotationState};
use crate::clock::Clock;
use crate::keygen::{CaSubject, KeyMaterialGenerator, KeygenError};

/// Errors produced by the transition engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RotationError {
    /// A new rotation was requested while one is already running.
    #[error("cannot initiate rotation while another is in progress")]
    RotationInProgress,

    /// The requested target phase is not reachable from the current phase.
    #[error("can only switch to phase {target} from {allowed}, current phase is {current}")]
    IllegalTransition {
        /// The requested phase.
        target: RotationPhase,
        /// Human-readable list of legal source phases.
        allowed: String,
        /// The phase the record is actually in.
        current: RotationPhase,
    },

    /// The record's key sequences do not match its rotation state.
    #[error("{field} holds {actual} entries, transition to {target} requires {required}")]
    CorruptedKeyMaterial {
        /// The offending sequence.
        field: &'static str,
        /// The requested phase.
        target: RotationPhase,
        /// Entries the transition needs.
        required: usize,
        /// Entries actually present.
        actual: usize,
    },

    /// Fresh key material could not be generated.
    #[error(transparent)]
    Keygen(#[from] KeygenError),
}

impl RotationError {
    fn illegal(
        target: RotationPhase,
        allowed: &[RotationPhase],
        current: RotationPhase,
    ) -> Self {
        let allowed = allowed
            .iter()
            .map(RotationPhase::as_str)
            .collect::<Vec<_>>()
            .join(" or ");
        Self::IllegalTransition {
            target,
            allowed,
            current,
        }
    }
}

/// Normalized internal rotation request handed to the engine.
///
/// The daemon's driver builds this from an operator request or from the
/// auto-rotation schedule; all defaults are already resolved.
pub struct TransitionRequest<'a> {
    /// Clock stamping `started` and `last_rotated`.
    pub clock: &'a dyn Clock,
    /// Source of fresh key material.
    pub keygen: &'a dyn KeyMaterialGenerator,
    /// Phase to move to.
    pub target_phase: RotationPhase,
    /// Mode recorded on the descriptor.
    pub mode: RotationMode,
    /// Grace period of the rotation; zero forces a single-step rotation.
    pub grace_period: Duration,
    /// Phase deadlines recorded when a rotation starts.
    pub schedule: RotationSchedule,
    /// TTL of the generated TLS certificate authority.
    pub ca_ttl: Duration,
}

/// Computes the next certificate authority record for a rotation request.
///
/// The input record is never mutated; the caller is expected to
/// compare-and-swap the returned record against it.
///
/// # Errors
///
/// Returns [`RotationError`] when the transition is illegal, the record is
/// internally inconsistent, or key generation fails.
pub fn process_rotation(
    req: &TransitionRequest<'_>,
    ca: &CertAuthority,
) -> Result<CertAuthority, RotationError> {
    let current = ca.rotation().clone();
    let mut next = ca.clone();

    match req.target_phase {
        RotationPhase::UpdateClients => {
            if current.state == RotationState::InProgress {
                return Err(RotationError::RotationInProgress);
            }
            start_new_rotation(req, &mut next)?;
            Ok(next)
        },
        RotationPhase::UpdateServers => {
            if current.phase != RotationPhase::UpdateClients {
                return Err(RotationError::illegal(
                    RotationPhase::UpdateServers,
                    &[RotationPhase::UpdateClients],
                    current.phase,
                ));
            }
            // Pure descriptor update signalling components to reload and
            // start serving the new credentials.
            let mut rotation = current;
            rotation.phase = RotationPhase::UpdateServers;
            rotation.mode = Some(req.mode);
            next.set_rotation(rotation);
            Ok(next)
        },
        RotationPhase::Rollback => match current.phase {
            RotationPhase::UpdateClients | RotationPhase::UpdateServers => {
                start_rollback(&mut next)?;
                Ok(next)
            },
            phase => Err(RotationError::illegal(
                RotationPhase::Rollback,
                &[RotationPhase::UpdateClients, RotationPhase::UpdateServers],
                phase,
            )),
        },
        RotationPhase::Standby => match current.phase {
            RotationPhase::UpdateServers => {
                complete_rotation(req.clock, &mut next);
                Ok(next)
            },
            RotationPhase::Rollback => {
                complete_rollback(&mut next);
                Ok(next)
            },
            phase => Err(RotationError::illegal(
                RotationPhase::Standby,
                &[RotationPhase::UpdateServers, RotationPhase::Rollback],
                phase,
            )),
        },
    }
}

/// Starts a new rotation, minting fresh SSH and TLS material.
fn start_new_rotation(
    req: &TransitionRequest<'_>,
    ca: &mut CertAuthority,
) -> Result<(), RotationError> {
    let ssh = req.keygen.generate_ssh_key_pair("")?;
    let tls = req.keygen.generate_self_signed_ca(
        &CaSubject::for_cluster(ca.cluster_name()),
        &[],
        req.ca_ttl,
    )?;

    let mut rotation = ca.rotation().clone();
    rotation.current_id = Uuid::new_v4().to_string();
    rotation.mode = Some(req.mode);
    rotation.schedule = Some(req.schedule);
    rotation.started = Some(req.clock.now());
    rotation.grace_period = req.grace_period;

    if req.grace_period.is_zero() {
        // Force rotation: replace everything outright, retaining no trust
        // in the old material. The rotation starts and completes in the
        // same step, so the descriptor goes straight back to standby.
        ca.set_signing_keys(vec![ssh.private_key_pem]);
        ca.set_checking_keys(vec![ssh.public_key]);
        ca.set_tls_key_pairs(vec![tls]);
        rotation.reset_to_standby();
        rotation.last_rotated = Some(req.clock.now());
    } else {
        let prev_signing = ca
            .active_signing_key()
            .ok_or(RotationError::CorruptedKeyMaterial {
                field: "signing_keys",
                target: RotationPhase::UpdateClients,
                required: 1,
                actual: 0,
            })?
            .to_string();
        let prev_checking = ca
            .active_checking_key()
            .ok_or(RotationError::CorruptedKeyMaterial {
                field: "checking_keys",
                target: RotationPhase::UpdateClients,
                required: 1,
                actual: 0,
            })?
            .to_string();
        let prev_tls = ca
            .active_tls_key_pair()
            .cloned()
            .ok_or(RotationError::CorruptedKeyMaterial {
                field: "tls_key_pairs",
                target: RotationPhase::UpdateClients,
                required: 1,
                actual: 0,
            })?;

        // The new material becomes the active slot, the previous active
        // slot stays behind it as trusted.
        ca.set_signing_keys(vec![ssh.private_key_pem, prev_signing]);
        ca.set_checking_keys(vec![ssh.public_key, prev_checking]);
        ca.set_tls_key_pairs(vec![tls, prev_tls]);
        rotation.state = RotationState::InProgress;
        rotation.phase = RotationPhase::UpdateClients;
    }

    ca.set_rotation(rotation);
    Ok(())
}

/// Reverts the active signer to the old CA, keeping the attempted TLS
/// certificate trusted until components reload.
fn start_rollback(ca: &mut CertAuthority) -> Result<(), RotationError> {
    let corrupted = |field: &'static str, actual: usize| RotationError::CorruptedKeyMaterial {
        field,
        target: RotationPhase::Rollback,
        required: 2,
        actual,
    };

    let prev_signing = ca
        .signing_keys()
        .get(1)
        .cloned()
        .ok_or_else(|| corrupted("signing_keys", ca.signing_keys().len()))?;
    let prev_checking = ca
        .checking_keys()
        .get(1)
        .cloned()
        .ok_or_else(|| corrupted("checking_keys", ca.checking_keys().len()))?;
    let attempted_tls = ca
        .tls_key_pairs()
        .first()
        .cloned()
        .ok_or_else(|| corrupted("tls_key_pairs", 0))?;
    let prev_tls = ca
        .tls_key_pairs()
        .get(1)
        .cloned()
        .ok_or_else(|| corrupted("tls_key_pairs", ca.tls_key_pairs().len()))?;

    let mut rotation = ca.rotation().clone();
    // Rollback always hands control back to the operator.
    rotation.mode = Some(RotationMode::Manual);
    rotation.state = RotationState::InProgress;
    rotation.phase = RotationPhase::Rollback;

    ca.set_signing_keys(vec![prev_signing]);
    ca.set_checking_keys(vec![prev_checking]);
    ca.set_tls_key_pairs(vec![prev_tls, attempted_tls.trusted_only()]);
    ca.set_rotation(rotation);
    Ok(())
}

/// Completes a rotation: only the new material stays trusted.
fn complete_rotation(clock: &dyn Clock, ca: &mut CertAuthority) {
    truncate_to_active(ca);

    let mut rotation = ca.rotation().clone();
    rotation.reset_to_standby();
    rotation.last_rotated = Some(clock.now());
    ca.set_rotation(rotation);
}

/// Completes a rollback: the original material, restored to the active
/// slot by [`start_rollback`], becomes the only trusted set again.
///
/// `last_rotated` is deliberately left untouched: an aborted rotation is
/// not a rotation.
fn complete_rollback(ca: &mut CertAuthority) {
    truncate_to_active(ca);

    let mut rotation = ca.rotation().clone();
    rotation.reset_to_standby();
    ca.set_rotation(rotation);
}

/// Drops every entry behind the active slot in all three sequences.
fn truncate_to_active(ca: &mut CertAuthority) {
    let mut signing = ca.signing_keys().to_vec();
    signing.truncate(1);
    ca.set_signing_keys(signing);

    let mut checking = ca.checking_keys().to_vec();
    checking.truncate(1);
    ca.set_checking_keys(checking);

    let mut pairs = ca.tls_key_pairs().to_vec();
    pairs.truncate(1);
    ca.set_tls_key_pairs(pairs);
}
