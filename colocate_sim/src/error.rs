//! Error types for the simulation harness.

use colocate_core::LocalizationError;
use colocate_env::EnvError;
use std::time::Duration;
use thiserror::Error;

/// Why a scenario step failed.
#[derive(Debug, Error)]
pub enum SimError {
    /// A scenario assertion did not hold
    #[error("Check failed: {0}")]
    Check(String),

    /// A manager call returned an error
    #[error("Localization error: {0}")]
    Localization(#[from] LocalizationError),

    /// The simulated network refused an operation
    #[error("Network error: {0}")]
    Network(#[from] EnvError),

    /// A spawned scenario task panicked or was aborted
    #[error("Task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// The tokio runtime could not be built
    #[error("Runtime error: {0}")]
    Runtime(#[from] std::io::Error),

    /// The scenario ran past its virtual time limit
    #[error("Scenario exceeded {0:?} of virtual time")]
    TimedOut(Duration),
}

/// Fails the scenario with `message` unless `condition` holds.
pub fn check(condition: bool, message: impl Into<String>) -> Result<(), SimError> {
    if condition {
        Ok(())
    } else {
        Err(SimError::Check(message.into()))
    }
}
