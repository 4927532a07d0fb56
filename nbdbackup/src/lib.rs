//! nbdbackup: NBD export sessions for backup readers.
//!
//! A session targets one export on an NBD server, requests one meta context
//! (`base:allocation`, or a `qemu:dirty-bitmap:*` context for incremental
//! backups) and hands back a connected handle for block status queries and
//! chunked reads.
//!
//! # Library Usage
//!
//! ```ignore
//! use nbdbackup::{ExportConfig, ExportSession};
//!
//! let config = ExportConfig::new("sda").with_host("10.0.0.5");
//! let mut session = ExportSession::new(config)?.connect().await?;
//! for (offset, length) in session.chunks(0, session.export_size()) {
//!     let data = session.read(offset, length).await?;
//!     // write data somewhere
//! }
//! ```

pub mod config;
pub mod error;
pub mod session;

pub use config::{ExportConfig, parse_port};
pub use error::{ConfigError, Error, ErrorKind, NbdError, Result};
pub use session::{
    BlockingSession, ConnectedSession, ExportSession, ExtentRun, MAX_REQUEST_SIZE,
    MIN_REQUEST_SIZE, RequestChunks,
};

pub use nbd;
