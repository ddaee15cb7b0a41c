//! Rotation driver and scheduled worker.

mod service;
mod worker;

pub use service::{
    NormalizedRotateRequest, RotateRequest, RotationService, RotationServiceError,
};
pub use worker::AutoRotateWorker;
