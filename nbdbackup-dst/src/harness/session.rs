//! Session-level simulation harness.
//!
//! Generates a random export (data blocks, holes, a dirty bitmap), serves it
//! with randomized server behavior, and checks what sessions report against
//! the model.

use nbd::server::{ExportImage, ExportServer, ServerOptions};
use nbd::{Extent, NBD_STATE_DIRTY, NBD_STATE_HOLE, NBD_STATE_ZERO};
use nbdbackup::{ConnectedSession, ExportConfig, ExportSession, ExtentRun};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::io::{DuplexStream, duplex};

use super::SimulationError;

/// Granularity of allocation and dirty tracking in the model.
pub const MODEL_BLOCK_SIZE: u64 = 4096;

const EXPORT_NAME: &str = "sim-disk";
const CHECKPOINT: &str = "sim-checkpoint";

/// Actions that can be performed against a connected export.
#[derive(Debug, Clone)]
pub enum SessionAction {
    Read { offset: u64, length: u32 },
    Allocation { offset: u64, length: u64 },
    Dirty { offset: u64, length: u64 },
    IncrementalCopy,
}

/// Per-block state of the simulated export.
#[derive(Debug, Clone, Copy)]
struct ModelBlock {
    allocated: bool,
    dirty: bool,
}

/// Reference model of the export contents and metadata.
pub struct ExportOracle {
    data: Vec<u8>,
    blocks: Vec<ModelBlock>,
}

impl ExportOracle {
    pub fn generate(rng: &mut SmallRng, block_count: u64) -> Self {
        let block_size = MODEL_BLOCK_SIZE as usize;
        let mut data = vec![0u8; block_count as usize * block_size];
        let mut blocks = Vec::with_capacity(block_count as usize);
        for i in 0..block_count as usize {
            let allocated = rng.random_bool(0.6);
            let dirty = rng.random_bool(0.3);
            if allocated {
                rng.fill(&mut data[i * block_size..(i + 1) * block_size]);
            }
            blocks.push(ModelBlock { allocated, dirty });
        }
        Self { data, blocks }
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn read(&self, offset: u64, length: u32) -> &[u8] {
        &self.data[offset as usize..offset as usize + length as usize]
    }

    fn allocation_flags(block: &ModelBlock) -> u32 {
        if block.allocated {
            0
        } else {
            NBD_STATE_HOLE | NBD_STATE_ZERO
        }
    }

    fn dirty_flags(block: &ModelBlock) -> u32 {
        if block.dirty { NBD_STATE_DIRTY } else { 0 }
    }

    /// Merged runs of `flags` over `[offset, offset + length)`.
    fn runs(&self, offset: u64, length: u64, flags: fn(&ModelBlock) -> u32) -> Vec<ExtentRun> {
        let end = offset + length;
        let mut runs: Vec<ExtentRun> = Vec::new();
        let mut pos = offset;
        while pos < end {
            let index = pos / MODEL_BLOCK_SIZE;
            let block_end = ((index + 1) * MODEL_BLOCK_SIZE).min(end);
            let f = flags(&self.blocks[index as usize]);
            match runs.last_mut() {
                Some(last) if last.flags == f => last.length += block_end - pos,
                _ => runs.push(ExtentRun {
                    offset: pos,
                    length: block_end - pos,
                    flags: f,
                }),
            }
            pos = block_end;
        }
        runs
    }

    pub fn allocation(&self, offset: u64, length: u64) -> Vec<ExtentRun> {
        self.runs(offset, length, Self::allocation_flags)
    }

    pub fn dirty(&self, offset: u64, length: u64) -> Vec<ExtentRun> {
        self.runs(offset, length, Self::dirty_flags)
    }

    fn extent_map(&self, flags: fn(&ModelBlock) -> u32) -> Vec<Extent> {
        self.runs(0, self.size_bytes(), flags)
            .into_iter()
            .map(|run| Extent {
                length: run.length as u32,
                flags: run.flags,
            })
            .collect()
    }

    /// The image the test server exports for this model.
    pub fn image(&self) -> ExportImage {
        ExportImage::new(EXPORT_NAME, self.data.clone())
            .with_allocation(self.extent_map(Self::allocation_flags))
            .with_bitmap(CHECKPOINT, self.extent_map(Self::dirty_flags))
    }
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub operations: u64,
    pub reads: u64,
    pub allocation_queries: u64,
    pub dirty_queries: u64,
    pub incremental_copies: u64,
    pub bytes_copied: u64,
}

/// Session-level simulation harness.
///
/// Holds two sessions on the same export, one per meta context, the way a
/// backup tool opens a full and an incremental view side by side.
pub struct SessionHarness {
    rng: SmallRng,
    oracle: ExportOracle,
    allocation: Option<ConnectedSession<DuplexStream>>,
    dirty: Option<ConnectedSession<DuplexStream>>,
    stats: SessionStats,
}

impl SessionHarness {
    pub fn new(seed: u64, block_count: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let oracle = ExportOracle::generate(&mut rng, block_count);
        Self {
            rng,
            oracle,
            allocation: None,
            dirty: None,
            stats: SessionStats::default(),
        }
    }

    fn sample_server_options(&mut self) -> ServerOptions {
        ServerOptions {
            max_extents_per_reply: self
                .rng
                .random_bool(0.5)
                .then(|| self.rng.random_range(1..=4)),
            read_chunk_bytes: self
                .rng
                .random_bool(0.5)
                .then(|| self.rng.random_range(512..=16 * 1024)),
            ..Default::default()
        }
    }

    async fn open(
        &mut self,
        config: ExportConfig,
    ) -> Result<ConnectedSession<DuplexStream>, SimulationError> {
        let server = ExportServer::new(self.oracle.image(), self.sample_server_options());
        let (client_stream, server_stream) = duplex(1024 * 1024);
        tokio::spawn(async move {
            let _ = server.serve(server_stream).await;
        });

        let session = ExportSession::new(config)
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?
            .connect_with(client_stream)
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        session
            .require_meta_context()
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        if session.export_size() != self.oracle.size_bytes() {
            return Err(SimulationError::Mismatch {
                context: format!(
                    "export size {} != model size {}",
                    session.export_size(),
                    self.oracle.size_bytes()
                ),
            });
        }
        Ok(session)
    }

    pub async fn init(&mut self) -> Result<(), SimulationError> {
        let allocation = self.open(ExportConfig::new(EXPORT_NAME)).await?;
        let dirty = self
            .open(ExportConfig::new(EXPORT_NAME).with_dirty_bitmap(CHECKPOINT))
            .await?;
        self.allocation = Some(allocation);
        self.dirty = Some(dirty);
        Ok(())
    }

    fn allocation_session(
        &mut self,
    ) -> Result<&mut ConnectedSession<DuplexStream>, SimulationError> {
        self.allocation
            .as_mut()
            .ok_or_else(|| SimulationError::Unexpected("harness not initialized".into()))
    }

    fn dirty_session(&mut self) -> Result<&mut ConnectedSession<DuplexStream>, SimulationError> {
        self.dirty
            .as_mut()
            .ok_or_else(|| SimulationError::Unexpected("harness not initialized".into()))
    }

    /// Run the simulation for a given number of operations.
    pub async fn run(&mut self, operations: u64) -> Result<(), SimulationError> {
        for _ in 0..operations {
            let action = self.sample_action();
            self.execute(action).await?;
            self.stats.operations += 1;
        }
        Ok(())
    }

    fn sample_range(&mut self, max_len: u64) -> (u64, u64) {
        let size = self.oracle.size_bytes();
        let length = self.rng.random_range(1..=max_len.min(size));
        let max_offset = size - length;
        let offset = if max_offset > 0 {
            self.rng.random_range(0..=max_offset)
        } else {
            0
        };
        (offset, length)
    }

    fn sample_action(&mut self) -> SessionAction {
        let choice = self.rng.random_range(0..100);
        match choice {
            0..40 => {
                let (offset, length) = self.sample_range(64 * 1024);
                SessionAction::Read {
                    offset,
                    length: length as u32,
                }
            }
            40..65 => {
                let size = self.oracle.size_bytes();
                let (offset, length) = self.sample_range(size);
                SessionAction::Allocation { offset, length }
            }
            65..90 => {
                let size = self.oracle.size_bytes();
                let (offset, length) = self.sample_range(size);
                SessionAction::Dirty { offset, length }
            }
            _ => SessionAction::IncrementalCopy,
        }
    }

    /// Execute a single action.
    pub async fn execute(&mut self, action: SessionAction) -> Result<(), SimulationError> {
        match action {
            SessionAction::Read { offset, length } => {
                self.stats.reads += 1;
                let actual = self
                    .allocation_session()?
                    .read(offset, length)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                let expected = self.oracle.read(offset, length);
                if actual.as_ref() != expected {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "read(offset={}, len={}): first diff at byte {}",
                            offset,
                            length,
                            find_diff(expected, &actual)
                        ),
                    });
                }
            }
            SessionAction::Allocation { offset, length } => {
                self.stats.allocation_queries += 1;
                let actual = self
                    .allocation_session()?
                    .extents(offset, length)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                let expected = self.oracle.allocation(offset, length);
                check_runs("allocation", offset, length, &expected, &actual)?;
            }
            SessionAction::Dirty { offset, length } => {
                self.stats.dirty_queries += 1;
                let actual = self
                    .dirty_session()?
                    .extents(offset, length)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                let expected = self.oracle.dirty(offset, length);
                check_runs("dirty", offset, length, &expected, &actual)?;
            }
            SessionAction::IncrementalCopy => {
                self.stats.incremental_copies += 1;
                self.incremental_copy().await?;
            }
        }
        Ok(())
    }

    /// Copy every dirty run through the allocation session, the way an
    /// incremental backup walks a checkpoint, and compare with the model.
    async fn incremental_copy(&mut self) -> Result<(), SimulationError> {
        let size = self.oracle.size_bytes();
        let runs = self
            .dirty_session()?
            .extents(0, size)
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;

        let mut copied = 0u64;
        for run in runs.iter().filter(|r| r.is_dirty()) {
            let chunks: Vec<_> = self
                .allocation_session()?
                .chunks(run.offset, run.length)
                .collect();
            for (offset, length) in chunks {
                let data = self
                    .allocation_session()?
                    .read(offset, length)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                let expected = self.oracle.read(offset, length);
                if data.as_ref() != expected {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "incremental copy at offset {}: first diff at byte {}",
                            offset,
                            find_diff(expected, &data)
                        ),
                    });
                }
                copied += length as u64;
            }
        }

        let expected: u64 = self
            .oracle
            .dirty(0, size)
            .iter()
            .filter(|r| r.is_dirty())
            .map(|r| r.length)
            .sum();
        if copied != expected {
            return Err(SimulationError::Mismatch {
                context: format!("incremental copy moved {copied} bytes, expected {expected}"),
            });
        }
        self.stats.bytes_copied += copied;
        Ok(())
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}

fn check_runs(
    what: &str,
    offset: u64,
    length: u64,
    expected: &[ExtentRun],
    actual: &[ExtentRun],
) -> Result<(), SimulationError> {
    if expected != actual {
        return Err(SimulationError::Mismatch {
            context: format!(
                "{what}(offset={offset}, len={length}): expected {} runs, got {}: {:?} vs {:?}",
                expected.len(),
                actual.len(),
                expected.first(),
                actual.first()
            ),
        });
    }
    Ok(())
}

fn find_diff(expected: &[u8], actual: &[u8]) -> usize {
    for (i, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
        if e != a {
            return i;
        }
    }
    expected.len().min(actual.len())
}
