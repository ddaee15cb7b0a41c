//! Certificate authority records and the rotation state machine.

mod engine;
mod record;
mod state;

pub use engine::{process_rotation, RotationError, TransitionRequest};
pub use record::{
    CaKind, CaValidationError, CertAuthority, CertAuthorityId, TlsKeyPair, UnsupportedKindError,
};
pub use state::{
    Rotation, RotationMode, RotationPhase, RotationSchedule, RotationState, ScheduleError,
    UnsupportedModeError, UnsupportedPhaseError,
};
