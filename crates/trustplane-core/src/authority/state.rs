//! Rotation descriptor: states, phases, modes and the wall-clock schedule.
//!
//! The descriptor is serialized as part of the certificate authority record,
//! so every type here carries a stable snake_case wire shape. Enum values
//! round-trip through [`std::str::FromStr`] at the RPC boundary, which is
//! where "unsupported …" parameter errors are produced.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Clock;

/// Overall state of the rotation state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationState {
    /// The system is in standby mode and ready to take action.
    ///
    /// Bootstrap records that never rotated deserialize to this value.
    #[default]
    Standby,
    /// A rotation is in progress and split into phases.
    InProgress,
}

impl RotationState {
    /// Returns the state as its wire string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Standby => "standby",
            Self::InProgress => "in_progress",
        }
    }
}

impl fmt::Display for RotationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named waypoint of the rotation state machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationPhase {
    /// No action is taken.
    #[default]
    Standby,
    /// A new CA has been issued and clients pick up the new credentials;
    /// servers still present the old ones. Both CAs are trusted.
    UpdateClients,
    /// All components reload and present the new credentials; the old CA
    /// is still trusted so lagging components stay visible.
    UpdateServers,
    /// The active signer reverts to the old CA while the attempted new
    /// certificate stays trusted until components reload.
    Rollback,
}

impl RotationPhase {
    /// Returns the phase as its wire string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Standby => "standby",
            Self::UpdateClients => "update_clients",
            Self::UpdateServers => "update_servers",
            Self::Rollback => "rollback",
        }
    }
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown rotation phase supplied at the RPC boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported rotation phase: {phase:?}")]
pub struct UnsupportedPhaseError {
    /// The rejected input.
    pub phase: String,
}

impl FromStr for RotationPhase {
    type Err = UnsupportedPhaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standby" => Ok(Self::Standby),
            "update_clients" => Ok(Self::UpdateClients),
            "update_servers" => Ok(Self::UpdateServers),
            "rollback" => Ok(Self::Rollback),
            other => Err(UnsupportedPhaseError {
                phase: other.to_string(),
            }),
        }
    }
}

/// How phase transitions are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    /// An operator sets each phase explicitly.
    Manual,
    /// Phases advance on the schedule.
    Auto,
}

impl RotationMode {
    /// Returns the mode as its wire string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
        }
    }
}

impl fmt::Display for RotationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown rotation mode supplied at the RPC boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported rotation mode: {mode:?}")]
pub struct UnsupportedModeError {
    /// The rejected input.
    pub mode: String,
}

impl FromStr for RotationMode {
    type Err = UnsupportedModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            other => Err(UnsupportedModeError {
                mode: other.to_string(),
            }),
        }
    }
}

/// Errors produced by schedule generation and validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ScheduleError {
    /// A later deadline precedes an earlier one.
    #[error("rotation schedule field {later} precedes {earlier}")]
    OutOfOrder {
        /// The deadline that must come first.
        earlier: &'static str,
        /// The deadline that was found to be earlier than `earlier`.
        later: &'static str,
    },

    /// The grace period cannot be laid out on the calendar.
    #[error("grace period is out of schedulable range: {0}")]
    GraceOutOfRange(String),
}

/// Three absolute instants marking the latest-acceptable time to enter the
/// next phase of a staged rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RotationSchedule {
    /// Deadline to enter the `update_clients` phase.
    pub update_clients: DateTime<Utc>,
    /// Deadline to enter the `update_servers` phase.
    pub update_servers: DateTime<Utc>,
    /// Deadline to complete the rotation.
    pub standby: DateTime<Utc>,
}

impl RotationSchedule {
    /// Generates a schedule splitting `grace_period` evenly into three
    /// segments starting at the clock's current time.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::GraceOutOfRange`] if the grace period does
    /// not fit calendar arithmetic.
    pub fn generate(clock: &dyn Clock, grace_period: Duration) -> Result<Self, ScheduleError> {
        let now = clock.now();
        let step = |d: Duration| {
            chrono::Duration::from_std(d).map_err(|e| ScheduleError::GraceOutOfRange(e.to_string()))
        };
        Ok(Self {
            update_clients: now + step(grace_period / 3)?,
            update_servers: now + step(grace_period / 3 * 2)?,
            standby: now + step(grace_period)?,
        })
    }

    /// Checks that the three deadlines do not decrease.
    ///
    /// # Errors
    ///
    /// Returns [`ScheduleError::OutOfOrder`] naming the offending pair.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.update_servers < self.update_clients {
            return Err(ScheduleError::OutOfOrder {
                earlier: "update_clients",
                later: "update_servers",
            });
        }
        if self.standby < self.update_servers {
            return Err(ScheduleError::OutOfOrder {
                earlier: "update_servers",
                later: "standby",
            });
        }
        Ok(())
    }
}

/// The rotation descriptor carried by every certificate authority record.
///
/// A standby descriptor holds no residue of past attempts other than
/// `current_id`, `grace_period` and `last_rotated`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rotation {
    /// Overall state of the machine.
    #[serde(default)]
    pub state: RotationState,

    /// Current phase within an in-progress rotation.
    #[serde(default)]
    pub phase: RotationPhase,

    /// How transitions are driven; `None` outside a rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<RotationMode>,

    /// Opaque identifier of this rotation attempt.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub current_id: String,

    /// When the in-progress rotation started; `None` in standby.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<DateTime<Utc>>,

    /// When the last rotation completed. Not bumped by rollbacks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rotated: Option<DateTime<Utc>>,

    /// Wall-clock budget of the current or most recent staged rotation.
    #[serde(default, with = "humantime_serde")]
    pub grace_period: Duration,

    /// Phase deadlines of the in-progress rotation; `None` in standby.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<RotationSchedule>,
}

impl Rotation {
    /// Returns `true` when no rotation is in progress.
    #[must_use]
    pub fn is_standby(&self) -> bool {
        self.state == RotationState::Standby
    }

    /// Returns `true` when a rotation is in progress.
    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.state == RotationState::InProgress
    }

    /// Clears every in-progress field, returning the descriptor to standby.
    ///
    /// `current_id`, `grace_period` and `last_rotated` survive as the record
    /// of the most recent attempt.
    pub fn reset_to_standby(&mut self) {
        self.state = RotationState::Standby;
        self.phase = RotationPhase::Standby;
        self.mode = None;
        self.started = None;
        self.schedule = None;
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
