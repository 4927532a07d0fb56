//! Simulation harnesses for nbdbackup.
//!
//! Harnesses provide the infrastructure for running deterministic simulations:
//! - An export model used as the oracle
//! - Action generators for random operation sequences
//! - Statistics tracking

pub mod session;

pub use session::{ExportOracle, SessionAction, SessionHarness, SessionStats};

/// Error type for simulation failures.
#[derive(Debug)]
pub enum SimulationError {
    Mismatch { context: String },
    Unexpected(String),
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mismatch { context } => write!(f, "oracle mismatch: {}", context),
            Self::Unexpected(msg) => write!(f, "unexpected error: {}", msg),
        }
    }
}

impl std::error::Error for SimulationError {}
