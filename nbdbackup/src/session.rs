//! Export sessions.
//!
//! An [`ExportSession`] holds validated connection parameters and an
//! unconnected protocol handle. [`ExportSession::connect`] consumes it and
//! yields a [`ConnectedSession`], so a session can be connected at most once
//! and nothing can be read from one that never connected.
//!
//! ```ignore
//! use nbdbackup::{ExportConfig, ExportSession};
//!
//! let config = ExportConfig::new("sda").with_dirty_bitmap("checkpoint.1");
//! let mut session = ExportSession::new(config)?.connect().await?;
//! session.require_meta_context()?;
//! for run in session.extents(0, session.export_size()).await? {
//!     // copy dirty runs
//! }
//! ```

use bytes::Bytes;
use nbd::blocking::BlockingClient;
use nbd::{BlockSize, Extent, MetaContext, NbdClient, NbdError, NbdHandle};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::ExportConfig;
use crate::error::{Error, Result};

/// Largest read or status request a session issues (32 MiB).
pub const MAX_REQUEST_SIZE: u32 = 32 * 1024 * 1024;

/// Smallest request size worth issuing when chunking a backup (64 KiB).
pub const MIN_REQUEST_SIZE: u32 = 64 * 1024;

/// Unconnected session for one export.
#[derive(Debug)]
pub struct ExportSession {
    config: ExportConfig,
    handle: NbdHandle,
}

impl ExportSession {
    /// Validate `config` and create the protocol handle, without any I/O.
    pub fn new(config: ExportConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            handle: NbdHandle::new(),
        })
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn max_request_size(&self) -> u32 {
        MAX_REQUEST_SIZE
    }

    pub fn min_request_size(&self) -> u32 {
        MIN_REQUEST_SIZE
    }

    /// Register the meta context, then the export name. The context has to
    /// be on the handle before negotiation starts or the server never sees it.
    fn prepare(self) -> Result<(ExportConfig, NbdHandle)> {
        let Self { config, mut handle } = self;
        handle
            .add_meta_context(config.meta_context.as_str())
            .map_err(Error::Handshake)?;
        handle
            .set_export_name(config.export_name.as_str())
            .map_err(Error::Handshake)?;
        Ok((config, handle))
    }

    /// Connect over TCP and run the full handshake.
    ///
    /// One attempt, no retries. Wrap in `tokio::time::timeout` for a deadline.
    pub async fn connect(self) -> Result<ConnectedSession<TcpStream>> {
        let (config, handle) = self.prepare()?;
        info!(
            address = %config.address(),
            export = %config.export_name,
            meta_context = %config.meta_context,
            "connecting to NBD export"
        );
        let client = handle
            .connect_tcp(&config.host, config.port)
            .await
            .map_err(Error::Handshake)?;
        Ok(ConnectedSession::new(config, client))
    }

    /// Run the handshake over a caller-provided stream (Unix socket, tunnel,
    /// in-memory pipe). `host` and `port` are not used.
    pub async fn connect_with<S>(self, stream: S) -> Result<ConnectedSession<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (config, handle) = self.prepare()?;
        debug!(export = %config.export_name, "negotiating NBD export over provided stream");
        let client = handle.connect(stream).await.map_err(Error::Handshake)?;
        Ok(ConnectedSession::new(config, client))
    }

    /// Blocking variant of [`connect`](Self::connect).
    ///
    /// Must not be called from within an async runtime.
    pub fn connect_blocking(self) -> Result<BlockingSession> {
        let (config, handle) = self.prepare()?;
        info!(
            address = %config.address(),
            export = %config.export_name,
            meta_context = %config.meta_context,
            "connecting to NBD export"
        );
        let client =
            BlockingClient::connect_tcp(handle, &config.host, config.port).map_err(Error::Handshake)?;
        log_grant(&config, client.client().meta_contexts());
        Ok(BlockingSession { config, client })
    }
}

fn log_grant(config: &ExportConfig, granted: &[MetaContext]) {
    if granted.iter().any(|c| c.name == config.meta_context) {
        debug!(meta_context = %config.meta_context, "meta context granted");
    } else {
        warn!(
            export = %config.export_name,
            meta_context = %config.meta_context,
            "server did not grant the requested meta context"
        );
    }
}

/// A contiguous run of the export sharing the same status flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExtentRun {
    pub offset: u64,
    pub length: u64,
    pub flags: u32,
}

impl ExtentRun {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn is_hole(&self) -> bool {
        (self.flags & nbd::NBD_STATE_HOLE) != 0
    }

    pub fn is_zero(&self) -> bool {
        (self.flags & nbd::NBD_STATE_ZERO) != 0
    }

    pub fn is_dirty(&self) -> bool {
        (self.flags & nbd::NBD_STATE_DIRTY) != 0
    }
}

/// Iterator over `(offset, length)` requests covering a byte range.
#[derive(Debug, Clone)]
pub struct RequestChunks {
    pos: u64,
    end: u64,
    max: u32,
}

impl RequestChunks {
    pub fn new(offset: u64, length: u64, max: u32) -> Self {
        Self {
            pos: offset,
            end: offset.saturating_add(length),
            max: max.max(1),
        }
    }
}

impl Iterator for RequestChunks {
    type Item = (u64, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end {
            return None;
        }
        let len = (self.end - self.pos).min(self.max as u64) as u32;
        let item = (self.pos, len);
        self.pos += len as u64;
        Some(item)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end - self.pos).div_ceil(self.max as u64) as usize;
        (remaining, Some(remaining))
    }
}

/// Accumulates block status replies into [`ExtentRun`]s for a range.
///
/// Servers may describe fewer bytes than requested, or overshoot the end;
/// the collector asks for whatever is still missing and clips the tail.
struct ExtentCollector {
    pos: u64,
    end: u64,
    runs: Vec<ExtentRun>,
}

impl ExtentCollector {
    fn new(offset: u64, length: u64) -> Self {
        Self {
            pos: offset,
            end: offset.saturating_add(length),
            runs: Vec::new(),
        }
    }

    fn next_request(&self) -> Option<(u64, u32)> {
        (self.pos < self.end).then(|| {
            let len = (self.end - self.pos).min(MAX_REQUEST_SIZE as u64) as u32;
            (self.pos, len)
        })
    }

    fn push(&mut self, extents: Vec<Extent>) -> std::result::Result<(), NbdError> {
        let before = self.pos;
        for extent in extents {
            if self.pos >= self.end {
                break;
            }
            let length = (extent.length as u64).min(self.end - self.pos);
            match self.runs.last_mut() {
                Some(last) if last.flags == extent.flags && last.end() == self.pos => {
                    last.length += length;
                }
                _ => self.runs.push(ExtentRun {
                    offset: self.pos,
                    length,
                    flags: extent.flags,
                }),
            }
            self.pos += length;
        }
        if self.pos == before {
            return Err(NbdError::MalformedReply {
                reason: "block status reply made no progress",
            });
        }
        Ok(())
    }

    fn finish(self) -> Vec<ExtentRun> {
        self.runs
    }
}

/// A session that completed the NBD handshake.
pub struct ConnectedSession<S = TcpStream> {
    config: ExportConfig,
    client: NbdClient<S>,
}

impl<S> ConnectedSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(config: ExportConfig, client: NbdClient<S>) -> Self {
        info!(
            export = %config.export_name,
            size_bytes = client.size_bytes,
            contexts = client.meta_contexts().len(),
            "connected to NBD export"
        );
        log_grant(&config, client.meta_contexts());
        Self { config, client }
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn max_request_size(&self) -> u32 {
        MAX_REQUEST_SIZE
    }

    pub fn min_request_size(&self) -> u32 {
        MIN_REQUEST_SIZE
    }

    pub fn export_size(&self) -> u64 {
        self.client.size_bytes
    }

    pub fn transmission_flags(&self) -> u16 {
        self.client.transmission_flags
    }

    pub fn is_read_only(&self) -> bool {
        self.client.is_read_only()
    }

    pub fn can_multi_conn(&self) -> bool {
        self.client.can_multi_conn()
    }

    pub fn block_size(&self) -> Option<BlockSize> {
        self.client.block_size
    }

    pub fn granted_meta_contexts(&self) -> &[MetaContext] {
        self.client.meta_contexts()
    }

    pub fn has_meta_context(&self, name: &str) -> bool {
        self.client.meta_context_id(name).is_some()
    }

    /// Fail unless the server granted the configured meta context.
    ///
    /// Connecting alone does not check this: a server may silently drop a
    /// context it does not know, and block status then has nothing to report.
    pub fn require_meta_context(&self) -> Result<()> {
        if self.has_meta_context(&self.config.meta_context) {
            Ok(())
        } else {
            Err(Error::MetaContextNotGranted {
                name: self.config.meta_context.clone(),
            })
        }
    }

    /// Split `[offset, offset + length)` into requests of at most
    /// `max_request_size` bytes.
    pub fn chunks(&self, offset: u64, length: u64) -> RequestChunks {
        RequestChunks::new(offset, length, MAX_REQUEST_SIZE)
    }

    /// Read up to `max_request_size` bytes.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes> {
        check_request_size(length)?;
        self.client
            .read(offset, length)
            .await
            .map_err(Error::Transmission)
    }

    /// One block status request for the configured meta context.
    pub async fn block_status(&mut self, offset: u64, length: u32) -> Result<Vec<Extent>> {
        self.client
            .block_status(&self.config.meta_context, offset, length)
            .await
            .map_err(Error::Transmission)
    }

    /// Status runs covering `[offset, offset + length)` for the configured
    /// meta context, merged where adjacent runs share flags.
    pub async fn extents(&mut self, offset: u64, length: u64) -> Result<Vec<ExtentRun>> {
        let mut collector = ExtentCollector::new(offset, length);
        while let Some((pos, len)) = collector.next_request() {
            let extents = self.block_status(pos, len).await?;
            collector.push(extents).map_err(Error::Transmission)?;
        }
        Ok(collector.finish())
    }

    pub fn client(&self) -> &NbdClient<S> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut NbdClient<S> {
        &mut self.client
    }

    pub fn into_client(self) -> NbdClient<S> {
        self.client
    }

    /// Send `NBD_CMD_DISC` and close the transport.
    pub async fn disconnect(self) -> Result<()> {
        debug!(export = %self.config.export_name, "disconnecting");
        self.client.disconnect().await.map_err(Error::Transmission)
    }
}

fn check_request_size(length: u32) -> Result<()> {
    if length > MAX_REQUEST_SIZE {
        return Err(Error::Transmission(NbdError::RequestTooLarge {
            length_bytes: length,
            max_bytes: MAX_REQUEST_SIZE,
        }));
    }
    Ok(())
}

/// Synchronous counterpart of [`ConnectedSession`] over TCP.
pub struct BlockingSession {
    config: ExportConfig,
    client: BlockingClient,
}

impl BlockingSession {
    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn max_request_size(&self) -> u32 {
        MAX_REQUEST_SIZE
    }

    pub fn min_request_size(&self) -> u32 {
        MIN_REQUEST_SIZE
    }

    pub fn export_size(&self) -> u64 {
        self.client.client().size_bytes
    }

    pub fn transmission_flags(&self) -> u16 {
        self.client.client().transmission_flags
    }

    pub fn block_size(&self) -> Option<BlockSize> {
        self.client.client().block_size
    }

    pub fn granted_meta_contexts(&self) -> &[MetaContext] {
        self.client.client().meta_contexts()
    }

    pub fn has_meta_context(&self, name: &str) -> bool {
        self.client.client().meta_context_id(name).is_some()
    }

    pub fn require_meta_context(&self) -> Result<()> {
        if self.has_meta_context(&self.config.meta_context) {
            Ok(())
        } else {
            Err(Error::MetaContextNotGranted {
                name: self.config.meta_context.clone(),
            })
        }
    }

    pub fn chunks(&self, offset: u64, length: u64) -> RequestChunks {
        RequestChunks::new(offset, length, MAX_REQUEST_SIZE)
    }

    pub fn read(&mut self, offset: u64, length: u32) -> Result<Bytes> {
        check_request_size(length)?;
        self.client
            .read(offset, length)
            .map_err(Error::Transmission)
    }

    pub fn block_status(&mut self, offset: u64, length: u32) -> Result<Vec<Extent>> {
        self.client
            .block_status(&self.config.meta_context, offset, length)
            .map_err(Error::Transmission)
    }

    pub fn extents(&mut self, offset: u64, length: u64) -> Result<Vec<ExtentRun>> {
        let mut collector = ExtentCollector::new(offset, length);
        while let Some((pos, len)) = collector.next_request() {
            let extents = self.block_status(pos, len)?;
            collector.push(extents).map_err(Error::Transmission)?;
        }
        Ok(collector.finish())
    }

    pub fn disconnect(self) -> Result<()> {
        self.client.disconnect().map_err(Error::Transmission)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use nbd::server::{ContextPolicy, ExportImage, ExportServer, ServerOptions};
    use nbd::{NBD_STATE_DIRTY, NBD_STATE_HOLE, NBD_STATE_ZERO};
    use std::collections::BTreeMap;

    const MIB: u64 = 1024 * 1024;

    /// 4 MiB disk: 1 MiB data, 2 MiB hole, 1 MiB data; last MiB dirty in cp1.
    fn disk0() -> ExportImage {
        let mut data = vec![0u8; 4 * MIB as usize];
        data[..MIB as usize].fill(0x11);
        data[3 * MIB as usize..].fill(0x33);
        ExportImage::new("disk0", data)
            .with_allocation(vec![
                Extent { length: MIB as u32, flags: 0 },
                Extent { length: 2 * MIB as u32, flags: NBD_STATE_HOLE | NBD_STATE_ZERO },
                Extent { length: MIB as u32, flags: 0 },
            ])
            .with_bitmap(
                "cp1",
                vec![
                    Extent { length: 3 * MIB as u32, flags: 0 },
                    Extent { length: MIB as u32, flags: NBD_STATE_DIRTY },
                ],
            )
    }

    async fn serve(image: ExportImage, options: ServerOptions) -> std::net::SocketAddr {
        let (addr, _handle) = ExportServer::new(image, options)
            .spawn_local()
            .await
            .unwrap();
        addr
    }

    fn config_for(addr: std::net::SocketAddr, export: &str) -> ExportConfig {
        ExportConfig::new(export)
            .with_host(addr.ip().to_string())
            .with_port(addr.port())
    }

    #[test]
    fn empty_export_name_fails_at_construction() {
        let err = ExportSession::new(ExportConfig::new("")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn sizing_constants() {
        let session = ExportSession::new(ExportConfig::new("disk0")).unwrap();
        assert_eq!(session.max_request_size(), 33_554_432);
        assert_eq!(session.min_request_size(), 65_536);
    }

    #[test]
    fn request_chunks_cover_range() {
        let chunks: Vec<_> = RequestChunks::new(10, 25, 10).collect();
        assert_eq!(chunks, vec![(10, 10), (20, 10), (30, 5)]);
        assert_eq!(RequestChunks::new(0, 0, 10).count(), 0);
        assert_eq!(RequestChunks::new(0, 100, 10).size_hint(), (10, Some(10)));
    }

    #[test]
    fn collector_merges_and_clips() {
        let mut collector = ExtentCollector::new(100, 50);
        assert_eq!(collector.next_request(), Some((100, 50)));
        collector
            .push(vec![Extent { length: 20, flags: 0 }, Extent { length: 10, flags: 0 }])
            .unwrap();
        assert_eq!(collector.next_request(), Some((130, 20)));
        collector
            .push(vec![Extent { length: 500, flags: NBD_STATE_HOLE }])
            .unwrap();
        assert_eq!(collector.next_request(), None);
        assert_eq!(
            collector.finish(),
            vec![
                ExtentRun { offset: 100, length: 30, flags: 0 },
                ExtentRun { offset: 130, length: 20, flags: NBD_STATE_HOLE },
            ]
        );
    }

    #[test]
    fn collector_rejects_empty_reply() {
        let mut collector = ExtentCollector::new(0, 10);
        assert!(collector.push(Vec::new()).is_err());
    }

    #[tokio::test]
    async fn connect_grants_base_allocation() {
        let addr = serve(disk0(), ServerOptions::default()).await;
        let mut session = ExportSession::new(config_for(addr, "disk0"))
            .unwrap()
            .connect()
            .await
            .unwrap();

        assert_eq!(session.export_size(), 4 * MIB);
        assert_eq!(session.granted_meta_contexts().len(), 1);
        assert_eq!(session.granted_meta_contexts()[0].name, "base:allocation");
        session.require_meta_context().unwrap();

        let runs = session.extents(0, session.export_size()).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert!(runs[1].is_hole() && runs[1].is_zero());
        assert_eq!(runs[2].offset, 3 * MIB);
        session.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn dirty_bitmap_context() {
        let addr = serve(disk0(), ServerOptions::default()).await;
        let config = config_for(addr, "disk0").with_dirty_bitmap("cp1");
        let mut session = ExportSession::new(config).unwrap().connect().await.unwrap();
        session.require_meta_context().unwrap();

        let dirty: Vec<_> = session
            .extents(0, 4 * MIB)
            .await
            .unwrap()
            .into_iter()
            .filter(ExtentRun::is_dirty)
            .collect();
        assert_eq!(dirty, vec![ExtentRun { offset: 3 * MIB, length: MIB, flags: NBD_STATE_DIRTY }]);

        let data = session.read(dirty[0].offset, dirty[0].length as u32).await.unwrap();
        assert!(data.iter().all(|&b| b == 0x33));
    }

    #[tokio::test]
    async fn missing_bitmap_omitted_by_server() {
        // Observed with the default (qemu-like) policy: connect succeeds and
        // nothing is granted.
        let addr = serve(disk0(), ServerOptions::default()).await;
        let config = config_for(addr, "disk0").with_dirty_bitmap("checkpoint1");
        let session = ExportSession::new(config).unwrap().connect().await.unwrap();
        assert!(session.granted_meta_contexts().is_empty());
        let err = session.require_meta_context().unwrap_err();
        assert!(matches!(err, Error::MetaContextNotGranted { ref name } if name == "qemu:dirty-bitmap:checkpoint1"));
    }

    #[tokio::test]
    async fn missing_bitmap_rejected_by_server() {
        let options = ServerOptions {
            context_policy: ContextPolicy::Reject,
            ..Default::default()
        };
        let addr = serve(disk0(), options).await;
        let config = config_for(addr, "disk0").with_dirty_bitmap("checkpoint1");
        let err = ExportSession::new(config)
            .unwrap()
            .connect()
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Negotiation);
        assert!(matches!(
            err.nbd(),
            Some(NbdError::OptionRejected {
                option: nbd::NBD_OPT_SET_META_CONTEXT,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn unknown_export_is_negotiation_error() {
        let addr = serve(disk0(), ServerOptions::default()).await;
        let err = ExportSession::new(config_for(addr, "disk1"))
            .unwrap()
            .connect()
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Negotiation);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_server_is_connection_error() {
        // Bind then drop to get a port with nothing listening.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = ExportSession::new(config_for(addr, "disk0"))
            .unwrap()
            .connect()
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn connected_session_stays_usable() {
        let addr = serve(disk0(), ServerOptions::default()).await;
        let mut session = ExportSession::new(config_for(addr, "disk0"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        for (offset, length) in session.chunks(0, 2 * MIB).collect::<Vec<_>>() {
            let data = session.read(offset, length).await.unwrap();
            assert_eq!(data.len(), length as usize);
        }
        let again = session.read(0, 4096).await.unwrap();
        assert!(again.iter().all(|&b| b == 0x11));
    }

    #[tokio::test]
    async fn oversized_read_rejected_before_io() {
        let addr = serve(disk0(), ServerOptions::default()).await;
        let mut session = ExportSession::new(config_for(addr, "disk0"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        let err = session.read(0, MAX_REQUEST_SIZE + 1).await.unwrap_err();
        assert!(matches!(
            err.nbd(),
            Some(NbdError::RequestTooLarge { .. })
        ));
        // Nothing was sent, so the connection is still in sync.
        assert_eq!(session.read(0, 16).await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn sizing_constants_independent_of_export() {
        let small = ExportImage::new("tiny", vec![0u8; 512]);
        let mut bitmaps = BTreeMap::new();
        bitmaps.insert("cp".to_string(), vec![Extent { length: 512, flags: 0 }]);
        let small = ExportImage { bitmaps, ..small };

        for (image, name) in [(disk0(), "disk0"), (small, "tiny")] {
            let addr = serve(image, ServerOptions::default()).await;
            let session = ExportSession::new(config_for(addr, name))
                .unwrap()
                .connect()
                .await
                .unwrap();
            assert_eq!(session.max_request_size(), MAX_REQUEST_SIZE);
            assert_eq!(session.min_request_size(), MIN_REQUEST_SIZE);
        }
    }

    #[tokio::test]
    async fn short_block_status_replies_are_stitched() {
        let options = ServerOptions {
            max_extents_per_reply: Some(1),
            ..Default::default()
        };
        let addr = serve(disk0(), options).await;
        let mut session = ExportSession::new(config_for(addr, "disk0"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        let runs = session.extents(0, 4 * MIB).await.unwrap();
        assert_eq!(runs.len(), 3);
        assert_eq!(runs.iter().map(|r| r.length).sum::<u64>(), 4 * MIB);
    }

    #[tokio::test]
    async fn connect_with_in_memory_stream() {
        let (client_stream, server_stream) = tokio::io::duplex(1024 * 1024);
        let server = ExportServer::new(disk0(), ServerOptions::default());
        tokio::spawn(async move {
            let _ = server.serve(server_stream).await;
        });

        let mut session = ExportSession::new(ExportConfig::new("disk0"))
            .unwrap()
            .connect_with(client_stream)
            .await
            .unwrap();
        assert!(session.has_meta_context("base:allocation"));
        let extents = session.block_status(0, MIB as u32).await.unwrap();
        assert_eq!(extents, vec![Extent { length: MIB as u32, flags: 0 }]);
    }

    #[test]
    fn blocking_session_round_trip() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let addr = runtime.block_on(serve(disk0(), ServerOptions::default()));

        let config = config_for(addr, "disk0").with_dirty_bitmap("cp1");
        let mut session = ExportSession::new(config)
            .unwrap()
            .connect_blocking()
            .unwrap();
        session.require_meta_context().unwrap();
        assert_eq!(session.export_size(), 4 * MIB);

        let runs = session.extents(0, 4 * MIB).unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[1].is_dirty());

        let data = session.read(3 * MIB, 4096).unwrap();
        assert!(data.iter().all(|&b| b == 0x33));
        session.disconnect().unwrap();
    }
}
