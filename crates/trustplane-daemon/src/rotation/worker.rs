//! The auto-rotation worker.
//!
//! A timer-driven loop that advances in-progress automatic rotations once
//! their schedule deadlines pass. Each tick delegates to
//! [`RotationService::auto_rotate_cert_authorities`]; tick errors are
//! logged and the loop keeps running, because a transient store failure
//! must not strand a scheduled rotation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use super::service::{RotationService, RotationServiceError};

/// Periodic driver of automatic rotations.
pub struct AutoRotateWorker {
    service: Arc<RotationService>,
    poll_interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl AutoRotateWorker {
    /// Creates a worker ticking at the service's configured poll interval.
    ///
    /// The interval must stay well below the smallest schedule segment;
    /// [`RotationService::new`] has already run
    /// [`crate::config::RotationConfig::validate`], so the value is
    /// within bounds here.
    #[must_use]
    pub fn new(service: Arc<RotationService>) -> Self {
        let poll_interval = service.config().poll_interval;
        Self {
            service,
            poll_interval,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns a handle for requesting shutdown.
    #[must_use]
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Runs the worker loop until shutdown is requested.
    #[allow(clippy::cast_possible_truncation)] // poll_interval is bounded far below u64::MAX ms
    pub async fn run(&self) {
        info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Auto-rotation worker starting"
        );

        while !self.shutdown.load(Ordering::Relaxed) {
            if let Err(error) = self.service.auto_rotate_cert_authorities().await {
                warn!(error = %error, "Automatic certificate authority rotation tick failed");
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        info!("Auto-rotation worker shutting down");
    }

    /// Runs a single tick, surfacing the error the loop would have logged.
    ///
    /// # Errors
    ///
    /// Returns whatever [`RotationService::auto_rotate_cert_authorities`]
    /// returns.
    pub async fn tick(&self) -> Result<(), RotationServiceError> {
        self.service.auto_rotate_cert_authorities().await
    }
}
