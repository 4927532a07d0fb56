//! Deterministic Simulation Testing (DST) for nbdbackup.
//!
//! Kept out of the main crates so the in-process NBD server and the export
//! model are never compiled into production binaries.
//!
//! ## Crate Structure
//!
//! - `harness` - Session harness and export oracle
//! - `simulation` - Deterministic runtime and simulation runners
//!
//! ## Running DST Tests
//!
//! ```bash
//! # PR-level quick tests
//! cargo test -p nbdbackup-dst simulation
//!
//! # Nightly long-running tests, with deterministic scheduling
//! RUSTFLAGS="--cfg tokio_unstable" cargo test -p nbdbackup-dst simulation -- --ignored
//! ```
//!
//! Set `DST_SEED` to replay a failing run.

pub mod harness;
pub mod simulation;

pub use harness::{ExportOracle, SessionAction, SessionHarness, SessionStats, SimulationError};
pub use simulation::{build_runtime, get_seed, run_session_simulation};
