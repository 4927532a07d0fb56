//! Blocking facade over [`NbdClient`].
//!
//! Callers that are not running inside a tokio runtime (backup scripts,
//! worker threads) get the same handshake and transmission behavior through
//! a private current-thread runtime owned by the client.
//!
//! ```ignore
//! use nbd::{NbdHandle, blocking::BlockingClient};
//!
//! let mut handle = NbdHandle::new();
//! handle.add_meta_context("base:allocation")?;
//! handle.set_export_name("disk0")?;
//! let mut client = BlockingClient::connect_tcp(handle, "localhost", 10809)?;
//! let extents = client.block_status("base:allocation", 0, 1 << 20)?;
//! ```

use std::io;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};

use crate::client::{NbdClient, NbdHandle};
use crate::protocol::*;

/// A connected NBD client driven synchronously.
///
/// Must not be used from within an async context: every call blocks the
/// current thread on the private runtime.
pub struct BlockingClient {
    runtime: Runtime,
    inner: NbdClient<TcpStream>,
}

impl BlockingClient {
    /// Connect over TCP, blocking until the handshake completes or fails.
    pub fn connect_tcp(handle: NbdHandle, host: &str, port: u16) -> Result<Self, NbdError> {
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| NbdError::Io(io::Error::other(format!("runtime error: {e}"))))?;
        let inner = runtime.block_on(handle.connect_tcp(host, port))?;
        Ok(Self { runtime, inner })
    }

    pub fn client(&self) -> &NbdClient<TcpStream> {
        &self.inner
    }

    pub fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, NbdError> {
        self.runtime.block_on(self.inner.read(offset, length))
    }

    pub fn block_status(
        &mut self,
        context: &str,
        offset: u64,
        length: u32,
    ) -> Result<Vec<Extent>, NbdError> {
        self.runtime
            .block_on(self.inner.block_status(context, offset, length))
    }

    pub fn flush(&mut self) -> Result<(), NbdError> {
        self.runtime.block_on(self.inner.flush())
    }

    pub fn disconnect(self) -> Result<(), NbdError> {
        let Self { runtime, inner } = self;
        runtime.block_on(inner.disconnect())
    }
}
