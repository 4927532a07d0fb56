//! Simulation runners and utilities.
//!
//! With `--cfg tokio_unstable` the runtime's scheduling RNG is seeded too, so a
//! `DST_SEED` replays the exact interleaving of client and server tasks.

use crate::harness::{SessionHarness, SimulationError};

/// Build a single-threaded tokio runtime for simulation.
pub fn build_runtime(seed: u64) -> tokio::runtime::Runtime {
    let mut builder = tokio::runtime::Builder::new_current_thread();
    builder.enable_all();
    #[cfg(tokio_unstable)]
    builder.rng_seed(tokio::runtime::RngSeed::from_bytes(&seed.to_le_bytes()));
    #[cfg(not(tokio_unstable))]
    let _ = seed;
    builder.build().expect("failed to build runtime")
}

/// Run a session simulation over an export of `block_count` model blocks.
pub async fn run_session_simulation(
    seed: u64,
    block_count: u64,
    operations: u64,
) -> Result<(), SimulationError> {
    tracing::info!(seed, block_count, operations, "session simulation");

    let mut harness = SessionHarness::new(seed, block_count);
    harness.init().await?;
    harness.run(operations).await?;

    let stats = harness.stats();
    tracing::info!(?stats, "session simulation complete");
    eprintln!("Session simulation complete: {:?}", stats);
    Ok(())
}

/// Get the seed from environment or generate a random one.
pub fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}
