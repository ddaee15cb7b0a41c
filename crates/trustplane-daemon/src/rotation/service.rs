//! The rotation driver.
//!
//! [`RotationService`] is the entry point the RPC layer and the
//! auto-rotation worker call into. It normalizes inbound requests, fans a
//! kind-less request out over both trust roots, runs the transition engine
//! and compare-and-swap-persists the result. CAS conflicts are surfaced,
//! never retried: a conflicting writer may have driven the machine into a
//! state where this caller's target is no longer legal.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use trustplane_core::authority::ScheduleError;
use trustplane_core::keygen::KeyMaterialGenerator;
use trustplane_core::{
    process_rotation, CaKind, CertAuthority, CertAuthorityId, Clock,
    NativeKeyMaterialGenerator, RotationError, RotationMode, RotationPhase, RotationSchedule,
    RotationState, SystemClock, TransitionRequest,
};

use crate::config::{ConfigError, RotationConfig};
use crate::store::{CaStore, StoreError};

/// Errors produced by the rotation driver and worker.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RotationServiceError {
    /// The transition engine rejected the request.
    #[error(transparent)]
    Rotation(#[from] RotationError),

    /// A supplied or generated schedule is invalid.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// The store rejected a read or write.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An external update tried to rewrite the local cluster's authority.
    #[error("cannot rotate local certificate authority")]
    LocalClusterNotAllowed,

    /// The auto-rotation loop found a phase it refuses to drive.
    #[error("automatic rotation cannot drive phase {phase}")]
    AutoRotateUnsupportedPhase {
        /// The phase found on the record.
        phase: RotationPhase,
    },

    /// An in-progress automatic rotation carries no schedule.
    #[error("automatic rotation requires a schedule")]
    MissingSchedule,
}

/// An operator-facing rotation request.
///
/// Every field is optional; [`RotateRequest::normalize`] resolves the
/// defaults. A missing `kind` rotates both trust roots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RotateRequest {
    /// Authority to rotate; `None` rotates host then user.
    ///
    /// Serialized as `type` on the wire.
    #[serde(rename = "type")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<CaKind>,

    /// Grace period; `None` takes the configured default, zero forces a
    /// single-step rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[serde(with = "humantime_serde::option")]
    pub grace_period: Option<Duration>,

    /// Phase to move to; `None` starts a rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_phase: Option<RotationPhase>,

    /// Rotation mode; `None` defaults to manual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RotationMode>,

    /// Phase deadlines; `None` generates an even split of the grace
    /// period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<RotationSchedule>,
}

impl RotateRequest {
    /// Returns the authorities this request applies to, in fan-out order.
    #[must_use]
    pub fn kinds(&self) -> Vec<CaKind> {
        match self.kind {
            None => CaKind::ALL.to_vec(),
            Some(kind) => vec![kind],
        }
    }

    /// Resolves defaults and validates the request.
    ///
    /// The first meaningful phase is the implied target, manual the
    /// implied mode (it is the safer default), and a missing schedule is
    /// generated by splitting the grace period evenly.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError`] when a supplied schedule is out of order
    /// or the grace period cannot be laid out on the calendar.
    pub fn normalize(
        self,
        clock: &dyn Clock,
        default_grace_period: Duration,
    ) -> Result<NormalizedRotateRequest, ScheduleError> {
        let kinds = self.kinds();
        let target_phase = self.target_phase.unwrap_or(RotationPhase::UpdateClients);
        let mode = self.mode.unwrap_or(RotationMode::Manual);
        let grace_period = self.grace_period.unwrap_or(default_grace_period);
        let schedule = match self.schedule {
            None => RotationSchedule::generate(clock, grace_period)?,
            Some(schedule) => {
                schedule.validate()?;
                schedule
            },
        };

        Ok(NormalizedRotateRequest {
            kinds,
            target_phase,
            mode,
            grace_period,
            schedule,
        })
    }
}

/// A rotation request with every default resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRotateRequest {
    /// Authorities to rotate, in order.
    pub kinds: Vec<CaKind>,
    /// Phase to move to.
    pub target_phase: RotationPhase,
    /// Rotation mode.
    pub mode: RotationMode,
    /// Grace period; zero forces a single-step rotation.
    pub grace_period: Duration,
    /// Phase deadlines.
    pub schedule: RotationSchedule,
}

/// Drives certificate authority rotations against the store.
pub struct RotationService {
    store: Arc<dyn CaStore>,
    keygen: Arc<dyn KeyMaterialGenerator>,
    clock: Arc<dyn Clock>,
    cluster_name: String,
    config: RotationConfig,
}

impl std::fmt::Debug for RotationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationService")
            .field("cluster_name", &self.cluster_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RotationService {
    /// Creates a service over `store` for the local cluster.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `config` is out of bounds, so an
    /// unchecked poll interval can never reach the worker loop.
    pub fn new(
        store: Arc<dyn CaStore>,
        cluster_name: impl Into<String>,
        config: RotationConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            store,
            keygen: Arc::new(NativeKeyMaterialGenerator),
            clock: Arc::new(SystemClock),
            cluster_name: cluster_name.into(),
            config,
        })
    }

    /// Replaces the clock, for tests and simulations.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the key-material generator.
    #[must_use]
    pub fn with_keygen(mut self, keygen: Arc<dyn KeyMaterialGenerator>) -> Self {
        self.keygen = keygen;
        self
    }

    /// Returns the local cluster name.
    #[must_use]
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &RotationConfig {
        &self.config
    }

    /// Starts or advances a certificate authority rotation.
    ///
    /// A request without a kind applies to the host authority first, then
    /// the user authority. The fan-out stops at the first error; a
    /// half-rotated pair is a permitted observable outcome, repaired by
    /// the next invocation because the already-rotated authority has
    /// moved to a legal next state.
    ///
    /// # Errors
    ///
    /// Returns [`RotationServiceError`] on invalid requests, illegal
    /// transitions, store failures and CAS conflicts.
    pub async fn rotate_cert_authority(
        &self,
        req: RotateRequest,
    ) -> Result<(), RotationServiceError> {
        let req = req.normalize(&*self.clock, self.config.grace_period)?;

        for kind in &req.kinds {
            let id = CertAuthorityId {
                kind: *kind,
                cluster_name: self.cluster_name.clone(),
            };
            let existing = self.store.get_cert_authority(&id, true).await?;
            let transition = TransitionRequest {
                clock: &*self.clock,
                keygen: &*self.keygen,
                target_phase: req.target_phase,
                mode: req.mode,
                grace_period: req.grace_period,
                schedule: req.schedule,
                ca_ttl: self.config.ca_ttl,
            };
            let rotated = process_rotation(&transition, &existing)?;
            self.store
                .compare_and_swap_cert_authority(&rotated, &existing)
                .await?;

            match rotated.rotation().state {
                RotationState::InProgress => info!(
                    kind = %kind,
                    phase = %rotated.rotation().phase,
                    "Certificate authority rotation is in progress"
                ),
                RotationState::Standby => {
                    info!(kind = %kind, "Certificate authority rotation has been completed");
                },
            }
        }
        Ok(())
    }

    /// Applies an update of a trusted peer cluster's authority.
    ///
    /// Only the public halves are copied: checking keys, TLS key pairs
    /// and the rotation descriptor. No key generation, no state-machine
    /// dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`RotationServiceError::LocalClusterNotAllowed`] when the
    /// update names the local cluster, and store errors otherwise.
    pub async fn rotate_external_cert_authority(
        &self,
        ca: &CertAuthority,
    ) -> Result<(), RotationServiceError> {
        // RBAC enforces this upstream as well; rejecting here keeps a
        // local admin from rewriting the local authority through the
        // trusted-cluster path.
        if ca.cluster_name() == self.cluster_name {
            return Err(RotationServiceError::LocalClusterNotAllowed);
        }

        let existing = self.store.get_cert_authority(&ca.id(), false).await?;
        let mut updated = existing.clone();
        updated.set_checking_keys(ca.checking_keys().to_vec());
        updated.set_tls_key_pairs(ca.tls_key_pairs().to_vec());
        updated.set_rotation(ca.rotation().clone());

        self.store
            .compare_and_swap_cert_authority(&updated, &existing)
            .await?;
        Ok(())
    }

    /// Advances every in-progress automatic rotation whose schedule
    /// deadline has passed. Called by the worker on each tick.
    ///
    /// # Errors
    ///
    /// Returns the first error encountered; earlier authorities may have
    /// advanced.
    pub async fn auto_rotate_cert_authorities(&self) -> Result<(), RotationServiceError> {
        for kind in CaKind::ALL {
            let id = CertAuthorityId {
                kind,
                cluster_name: self.cluster_name.clone(),
            };
            let ca = self.store.get_cert_authority(&id, true).await?;
            self.auto_rotate(&ca).await?;
        }
        Ok(())
    }

    /// Advances a single authority if its schedule says so.
    async fn auto_rotate(&self, ca: &CertAuthority) -> Result<(), RotationServiceError> {
        let rotation = ca.rotation();
        if rotation.mode != Some(RotationMode::Auto) {
            return Ok(());
        }
        if rotation.state != RotationState::InProgress {
            return Ok(());
        }
        let Some(schedule) = rotation.schedule else {
            return Err(RotationServiceError::MissingSchedule);
        };

        let target_phase = match rotation.phase {
            RotationPhase::UpdateClients => {
                if self.clock.now() < schedule.update_servers {
                    return Ok(());
                }
                RotationPhase::UpdateServers
            },
            RotationPhase::UpdateServers => {
                if self.clock.now() < schedule.standby {
                    return Ok(());
                }
                RotationPhase::Standby
            },
            phase => {
                // Entering rollback hands the machine to the operator;
                // the loop never drives it further.
                self.downgrade_to_manual(ca).await;
                return Err(RotationServiceError::AutoRotateUnsupportedPhase { phase });
            },
        };

        info!(kind = %ca.kind(), phase = %target_phase, "Setting rotation phase");

        let transition = TransitionRequest {
            clock: &*self.clock,
            keygen: &*self.keygen,
            target_phase,
            mode: RotationMode::Auto,
            grace_period: rotation.grace_period,
            schedule,
            ca_ttl: self.config.ca_ttl,
        };
        let rotated = match process_rotation(&transition, ca) {
            Ok(rotated) => rotated,
            Err(error) => {
                self.downgrade_to_manual(ca).await;
                return Err(error.into());
            },
        };

        self.store
            .compare_and_swap_cert_authority(&rotated, ca)
            .await?;
        info!(kind = %ca.kind(), "Certificate authority rotation request is completed");
        Ok(())
    }

    /// Best-effort switch of a failed automatic rotation to manual mode,
    /// stopping further scheduled transitions until an operator steps in.
    async fn downgrade_to_manual(&self, ca: &CertAuthority) {
        let mut updated = ca.clone();
        let mut rotation = updated.rotation().clone();
        rotation.mode = Some(RotationMode::Manual);
        updated.set_rotation(rotation);

        match self
            .store
            .compare_and_swap_cert_authority(&updated, ca)
            .await
        {
            Ok(()) => warn!(
                kind = %ca.kind(),
                "Automatic rotation failed, switched the rotation to manual mode"
            ),
            Err(error) => warn!(
                kind = %ca.kind(),
                error = %error,
                "Automatic rotation failed and the manual-mode downgrade did not apply"
            ),
        }
    }
}

mod humantime_serde {
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(
            duration: &Option<Duration>,
            serializer: S,
        ) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(duration) => {
                    serializer.serialize_some(&humantime::format_duration(*duration).to_string())
                },
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let s = Option::<String>::deserialize(deserializer)?;
            s.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use trustplane_core::{FixedClock, TlsKeyPair};

    use super::*;
    use crate::config::DEFAULT_GRACE_PERIOD;
    use crate::store::MemoryCaStore;

    fn bootstrap(kind: CaKind, cluster_name: &str) -> CertAuthority {
        CertAuthority::new(
            kind,
            cluster_name,
            format!("{kind}-ssh-private"),
            format!("{kind}-ssh-public"),
            TlsKeyPair {
                cert: format!("{kind}-tls-cert"),
                key: Some(format!("{kind}-tls-key")),
            },
        )
        .unwrap()
    }

    fn seeded_service(clock: &FixedClock) -> (Arc<MemoryCaStore>, RotationService) {
        let store = Arc::new(MemoryCaStore::new());
        store.insert(bootstrap(CaKind::Host, "example.com")).unwrap();
        store.insert(bootstrap(CaKind::User, "example.com")).unwrap();
        let service = RotationService::new(
            Arc::clone(&store) as Arc<dyn CaStore>,
            "example.com",
            RotationConfig::default(),
        )
        .unwrap()
        .with_clock(Arc::new(clock.clone()));
        (store, service)
    }

    async fn load(store: &MemoryCaStore, kind: CaKind) -> CertAuthority {
        store
            .get_cert_authority(
                &CertAuthorityId {
                    kind,
                    cluster_name: "example.com".to_string(),
                },
                true,
            )
            .await
            .unwrap()
    }

    #[test]
    fn construction_rejects_out_of_bounds_config() {
        let store = Arc::new(MemoryCaStore::new());
        let err = RotationService::new(
            store as Arc<dyn CaStore>,
            "example.com",
            RotationConfig {
                poll_interval: Duration::ZERO,
                ..RotationConfig::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::PollIntervalOutOfBounds { .. }));
    }

    #[test]
    fn normalize_fills_defaults() {
        let clock = FixedClock::new(Utc::now());
        let req = RotateRequest::default()
            .normalize(&clock, DEFAULT_GRACE_PERIOD)
            .unwrap();

        assert_eq!(req.kinds, vec![CaKind::Host, CaKind::User]);
        assert_eq!(req.target_phase, RotationPhase::UpdateClients);
        assert_eq!(req.mode, RotationMode::Manual);
        assert_eq!(req.grace_period, DEFAULT_GRACE_PERIOD);
        req.schedule.validate().unwrap();
    }

    #[test]
    fn normalize_rejects_out_of_order_schedule() {
        let clock = FixedClock::new(Utc::now());
        let now = clock.now();
        let req = RotateRequest {
            schedule: Some(RotationSchedule {
                update_clients: now + chrono::Duration::hours(2),
                update_servers: now + chrono::Duration::hours(1),
                standby: now + chrono::Duration::hours(3),
            }),
            ..RotateRequest::default()
        };

        assert!(req.normalize(&clock, DEFAULT_GRACE_PERIOD).is_err());
    }

    #[test]
    fn request_deserializes_from_rpc_shape() {
        let req: RotateRequest = serde_json::from_str(
            r#"{"type": "host", "grace_period": "0s", "mode": "manual"}"#,
        )
        .unwrap();

        assert_eq!(req.kind, Some(CaKind::Host));
        assert_eq!(req.grace_period, Some(Duration::ZERO));
        assert_eq!(req.kinds(), vec![CaKind::Host]);

        // The authority kind rides the wire as `type`.
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["type"], "host");
        assert!(json.get("kind").is_none());

        assert!(serde_json::from_str::<RotateRequest>(r#"{"type": "jwt"}"#).is_err());
        assert!(serde_json::from_str::<RotateRequest>(r#"{"kind": "host"}"#).is_err());
        assert!(
            serde_json::from_str::<RotateRequest>(r#"{"target_phase": "sideways"}"#).is_err()
        );
    }

    #[tokio::test]
    async fn force_rotation_of_a_single_kind() {
        let clock = FixedClock::new(Utc::now());
        let (store, service) = seeded_service(&clock);

        service
            .rotate_cert_authority(RotateRequest {
                kind: Some(CaKind::Host),
                grace_period: Some(Duration::ZERO),
                ..RotateRequest::default()
            })
            .await
            .unwrap();

        let host = load(&store, CaKind::Host).await;
        assert_eq!(host.rotation().state, RotationState::Standby);
        assert_eq!(host.signing_keys().len(), 1);
        assert_ne!(host.active_signing_key(), Some("host-ssh-private"));

        // The user authority is untouched.
        let user = load(&store, CaKind::User).await;
        assert_eq!(user.active_signing_key(), Some("user-ssh-private"));
    }

    #[tokio::test]
    async fn kindless_request_rotates_both_roots() {
        let clock = FixedClock::new(Utc::now());
        let (store, service) = seeded_service(&clock);

        service
            .rotate_cert_authority(RotateRequest::default())
            .await
            .unwrap();

        for kind in CaKind::ALL {
            let ca = load(&store, kind).await;
            assert_eq!(ca.rotation().state, RotationState::InProgress);
            assert_eq!(ca.rotation().phase, RotationPhase::UpdateClients);
            assert_eq!(ca.signing_keys().len(), 2);
        }
    }

    #[tokio::test]
    async fn fan_out_stops_at_the_first_error() {
        let clock = FixedClock::new(Utc::now());
        let store = Arc::new(MemoryCaStore::new());
        // Only the host authority exists.
        store.insert(bootstrap(CaKind::Host, "example.com")).unwrap();
        let service = RotationService::new(
            Arc::clone(&store) as Arc<dyn CaStore>,
            "example.com",
            RotationConfig::default(),
        )
        .unwrap()
        .with_clock(Arc::new(clock.clone()));

        let err = service
            .rotate_cert_authority(RotateRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RotationServiceError::Store(StoreError::NotFound { .. })
        ));

        // Partial fan-out is observable: the host authority rotated.
        let host = load(&store, CaKind::Host).await;
        assert_eq!(host.rotation().state, RotationState::InProgress);
    }

    #[tokio::test]
    async fn illegal_transition_is_surfaced_verbatim() {
        let clock = FixedClock::new(Utc::now());
        let (_store, service) = seeded_service(&clock);

        let err = service
            .rotate_cert_authority(RotateRequest {
                target_phase: Some(RotationPhase::UpdateServers),
                ..RotateRequest::default()
            })
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "can only switch to phase update_servers from update_clients, current phase is standby"
        );
    }

    #[tokio::test]
    async fn external_rotation_rejects_the_local_cluster() {
        let clock = FixedClock::new(Utc::now());
        let (_store, service) = seeded_service(&clock);

        let local = bootstrap(CaKind::Host, "example.com");
        let err = service
            .rotate_external_cert_authority(&local)
            .await
            .unwrap_err();
        assert!(matches!(err, RotationServiceError::LocalClusterNotAllowed));
        assert_eq!(err.to_string(), "cannot rotate local certificate authority");
    }

    #[tokio::test]
    async fn external_rotation_copies_public_halves_only() {
        let clock = FixedClock::new(Utc::now());
        let (store, service) = seeded_service(&clock);

        // Local replica of the peer cluster's authority, public-only.
        let replica = bootstrap(CaKind::Host, "peer.example.com").without_secrets();
        store.insert(replica).unwrap();

        // The peer advanced its own rotation and pushed the public view.
        let mut remote = bootstrap(CaKind::Host, "peer.example.com").without_secrets();
        remote.set_checking_keys(vec![
            "peer-new-public".to_string(),
            "peer-old-public".to_string(),
        ]);
        remote.set_tls_key_pairs(vec![
            TlsKeyPair {
                cert: "peer-new-cert".to_string(),
                key: None,
            },
            TlsKeyPair {
                cert: "peer-old-cert".to_string(),
                key: None,
            },
        ]);
        let mut rotation = remote.rotation().clone();
        rotation.state = RotationState::InProgress;
        rotation.phase = RotationPhase::UpdateClients;
        rotation.mode = Some(RotationMode::Manual);
        rotation.started = Some(clock.now());
        rotation.schedule =
            Some(RotationSchedule::generate(&clock, Duration::from_secs(3600)).unwrap());
        remote.set_rotation(rotation);

        service.rotate_external_cert_authority(&remote).await.unwrap();

        let stored = store
            .get_cert_authority(&remote.id(), false)
            .await
            .unwrap();
        assert_eq!(stored.checking_keys(), remote.checking_keys());
        assert_eq!(stored.tls_key_pairs(), remote.tls_key_pairs());
        assert_eq!(stored.rotation(), remote.rotation());
        assert!(stored.signing_keys().is_empty());
    }

    #[tokio::test]
    async fn auto_rotate_skips_manual_and_standby_records() {
        let clock = FixedClock::new(Utc::now());
        let (store, service) = seeded_service(&clock);

        // Standby records: nothing to do.
        service.auto_rotate_cert_authorities().await.unwrap();

        // A manual in-progress rotation is not advanced either.
        service
            .rotate_cert_authority(RotateRequest {
                kind: Some(CaKind::Host),
                ..RotateRequest::default()
            })
            .await
            .unwrap();
        clock.advance(DEFAULT_GRACE_PERIOD);
        service.auto_rotate_cert_authorities().await.unwrap();

        let host = load(&store, CaKind::Host).await;
        assert_eq!(host.rotation().phase, RotationPhase::UpdateClients);
    }

    #[tokio::test]
    async fn auto_rotate_refuses_rollback_and_downgrades_to_manual() {
        let clock = FixedClock::new(Utc::now());
        let (store, service) = seeded_service(&clock);

        service
            .rotate_cert_authority(RotateRequest {
                kind: Some(CaKind::Host),
                mode: Some(RotationMode::Auto),
                ..RotateRequest::default()
            })
            .await
            .unwrap();
        service
            .rotate_cert_authority(RotateRequest {
                kind: Some(CaKind::Host),
                target_phase: Some(RotationPhase::Rollback),
                ..RotateRequest::default()
            })
            .await
            .unwrap();

        // Rollback forced manual mode, so the loop skips the record. Force
        // the pathological shape an external writer could produce.
        let host = load(&store, CaKind::Host).await;
        let mut broken = host.clone();
        let mut rotation = broken.rotation().clone();
        rotation.mode = Some(RotationMode::Auto);
        broken.set_rotation(rotation);
        store
            .compare_and_swap_cert_authority(&broken, &host)
            .await
            .unwrap();

        let err = service.auto_rotate_cert_authorities().await.unwrap_err();
        assert!(matches!(
            err,
            RotationServiceError::AutoRotateUnsupportedPhase {
                phase: RotationPhase::Rollback,
            }
        ));

        // The best-effort downgrade landed.
        let host = load(&store, CaKind::Host).await;
        assert_eq!(host.rotation().mode, Some(RotationMode::Manual));
        assert_eq!(host.rotation().phase, RotationPhase::Rollback);
    }
}
