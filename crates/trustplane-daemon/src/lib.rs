//! # trustplane-daemon
//!
//! Runtime half of the trustplane cluster CA rotation subsystem: the
//! certificate authority store abstraction, the rotation driver serving
//! operator requests, and the worker advancing scheduled rotations.
//!
//! The domain model and the transition engine live in `trustplane-core`;
//! this crate wires them to a store and a clock.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use trustplane_daemon::config::RotationConfig;
//! use trustplane_daemon::rotation::{RotateRequest, RotationService};
//! use trustplane_daemon::store::{CaStore, MemoryCaStore};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryCaStore::new());
//! let service = RotationService::new(
//!     store as Arc<dyn CaStore>,
//!     "example.com",
//!     RotationConfig::default(),
//! )?;
//! service.rotate_cert_authority(RotateRequest::default()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod rotation;
pub mod store;

pub use config::RotationConfig;
pub use rotation::{AutoRotateWorker, RotateRequest, RotationService, RotationServiceError};
pub use store::{CaStore, MemoryCaStore, StoreError};
