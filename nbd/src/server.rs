//! In-memory NBD export server.
//!
//! Serves a single [`ExportImage`] with the read-side feature set a backup
//! client relies on: structured replies, `SET_META_CONTEXT` for
//! `base:allocation` and `qemu:dirty-bitmap:*`, `GO`/`INFO` with block size
//! constraints, `READ` (data and hole chunks), `BLOCK_STATUS` and `FLUSH`.
//!
//! It is transport-agnostic and handles one connection per `serve` call.
//! Intended for tests and simulations, enabled by the `server` feature.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::*;

/// Maximum length for option data during negotiation.
/// This prevents unbounded allocation from malicious clients.
const OPTION_DATA_MAX_BYTES: usize = 64 * 1024; // 64 KiB

/// Preferred block size advertised through `NBD_INFO_BLOCK_SIZE`.
const NBD_PREFERRED_BLOCK_SIZE: u32 = 4096;

/// What the server does with a requested meta context it does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContextPolicy {
    /// Leave it out of the reply and acknowledge the rest (qemu behavior).
    #[default]
    Omit,
    /// Fail the whole `SET_META_CONTEXT` with `NBD_REP_ERR_UNKNOWN`.
    Reject,
}

/// Server behavior knobs.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub structured_replies: bool,
    pub meta_contexts: bool,
    pub context_policy: ContextPolicy,
    /// Cap on descriptors per BLOCK_STATUS chunk, to exercise short replies.
    pub max_extents_per_reply: Option<usize>,
    /// Split data chunks of structured READ replies at this size.
    pub read_chunk_bytes: Option<u32>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            structured_replies: true,
            meta_contexts: true,
            context_policy: ContextPolicy::Omit,
            max_extents_per_reply: None,
            read_chunk_bytes: None,
        }
    }
}

/// Contents and metadata of the served export.
///
/// Extent maps run from offset zero and should cover the whole export;
/// bytes inside hole extents of the allocation map are expected to be zero.
#[derive(Debug, Clone)]
pub struct ExportImage {
    pub name: String,
    pub data: Vec<u8>,
    pub allocation: Vec<Extent>,
    /// Dirty bitmaps keyed by bitmap name (without the qemu prefix).
    pub bitmaps: BTreeMap<String, Vec<Extent>>,
    pub read_only: bool,
}

impl ExportImage {
    /// A fully allocated export.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        let allocation = vec![Extent {
            length: data.len() as u32,
            flags: 0,
        }];
        Self {
            name: name.into(),
            data,
            allocation,
            bitmaps: BTreeMap::new(),
            read_only: true,
        }
    }

    pub fn with_allocation(mut self, allocation: Vec<Extent>) -> Self {
        self.allocation = allocation;
        self
    }

    pub fn with_bitmap(mut self, name: impl Into<String>, extents: Vec<Extent>) -> Self {
        self.bitmaps.insert(name.into(), extents);
        self
    }

    pub fn size_bytes(&self) -> u64 {
        self.data.len() as u64
    }

    fn transmission_flags(&self) -> u16 {
        let mut flags = NBD_FLAG_HAS_FLAGS | NBD_FLAG_SEND_FLUSH | NBD_FLAG_CAN_MULTI_CONN;
        if self.read_only {
            flags |= NBD_FLAG_READ_ONLY;
        }
        flags
    }

    fn context_map(&self, name: &str) -> Option<&[Extent]> {
        if name == BASE_ALLOCATION {
            return Some(&self.allocation);
        }
        let bitmap = name.strip_prefix(QEMU_DIRTY_BITMAP_PREFIX)?;
        self.bitmaps.get(bitmap).map(Vec::as_slice)
    }
}

/// Clip an extent map to `[offset, offset + length)`.
pub fn extents_in_range(map: &[Extent], offset: u64, length: u64) -> Vec<Extent> {
    let end = offset + length;
    let mut pos = 0u64;
    let mut out = Vec::new();
    for extent in map {
        let ext_end = pos + extent.length as u64;
        if ext_end > offset && pos < end {
            let start = pos.max(offset);
            let stop = ext_end.min(end);
            out.push(Extent {
                length: (stop - start) as u32,
                flags: extent.flags,
            });
        }
        if ext_end >= end {
            break;
        }
        pos = ext_end;
    }
    out
}

/// Per-connection negotiation state.
#[derive(Default)]
struct Session {
    no_zeroes: bool,
    structured: bool,
    contexts: Vec<MetaContext>,
}

/// NBD server for a single in-memory export.
#[derive(Clone)]
pub struct ExportServer {
    image: Arc<ExportImage>,
    options: ServerOptions,
}

impl ExportServer {
    pub fn new(image: ExportImage, options: ServerOptions) -> Self {
        Self {
            image: Arc::new(image),
            options,
        }
    }

    pub fn image(&self) -> &ExportImage {
        &self.image
    }

    /// Serve a single NBD connection over any async stream.
    ///
    /// Returns when the client disconnects or an error occurs.
    pub async fn serve<S>(&self, mut stream: S) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut session = Session {
            no_zeroes: handshake(&mut stream).await?,
            ..Default::default()
        };
        if !self.negotiate_options(&mut stream, &mut session).await? {
            return Ok(());
        }
        self.transmission(&mut stream, &session).await
    }

    /// Accept connections forever, serving each on its own task.
    pub async fn listen(self, listener: TcpListener) -> Result<(), NbdError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve(stream).await {
                    debug!(%peer, error = %e, "NBD connection ended with error");
                }
            });
        }
    }

    /// Bind a loopback listener on an ephemeral port and start serving.
    pub async fn spawn_local(self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            if let Err(e) = self.listen(listener).await {
                warn!(error = %e, "NBD listener stopped");
            }
        });
        Ok((addr, handle))
    }

    async fn negotiate_options<S>(&self, stream: &mut S, session: &mut Session) -> Result<bool, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let export = &self.image;
        loop {
            let mut header = [0u8; 16];
            stream.read_exact(&mut header).await?;

            let magic = u64::from_be_bytes(header[0..8].try_into().unwrap());
            if magic != NBD_OPTS_MAGIC {
                return Err(NbdError::InvalidMagic {
                    expected: NBD_OPTS_MAGIC as u32,
                    actual: magic as u32,
                });
            }

            let option = u32::from_be_bytes(header[8..12].try_into().unwrap());
            let length = u32::from_be_bytes(header[12..16].try_into().unwrap()) as usize;

            // Bound allocation to prevent DoS from malicious clients
            if length > OPTION_DATA_MAX_BYTES {
                return Err(NbdError::RequestTooLarge {
                    length_bytes: length as u32,
                    max_bytes: OPTION_DATA_MAX_BYTES as u32,
                });
            }

            let mut data = vec![0u8; length];
            stream.read_exact(&mut data).await?;

            debug!(option = option_name(option), length, "NBD option");

            match option {
                NBD_OPT_EXPORT_NAME => {
                    if String::from_utf8_lossy(&data) != export.name {
                        return Ok(false);
                    }
                    let mut resp = [0u8; 10];
                    resp[0..8].copy_from_slice(&export.size_bytes().to_be_bytes());
                    resp[8..10].copy_from_slice(&export.transmission_flags().to_be_bytes());
                    stream.write_all(&resp).await?;
                    if !session.no_zeroes {
                        stream.write_all(&[0u8; 124]).await?;
                    }
                    // Structured replies cannot be used after EXPORT_NAME.
                    session.structured = false;
                    session.contexts.clear();
                    return Ok(true);
                }
                NBD_OPT_STRUCTURED_REPLY => {
                    if !self.options.structured_replies {
                        send_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?;
                    } else if !data.is_empty() {
                        send_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                    } else {
                        session.structured = true;
                        send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    }
                }
                NBD_OPT_SET_META_CONTEXT => {
                    self.set_meta_context(stream, session, &data).await?;
                }
                NBD_OPT_GO | NBD_OPT_INFO => {
                    let Some((name, _)) = read_string(&data) else {
                        send_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await?;
                        continue;
                    };
                    if name != export.name {
                        send_reply(stream, option, NBD_REP_ERR_UNKNOWN, b"unknown export")
                            .await?;
                        continue;
                    }

                    // INFO_EXPORT
                    let mut info = [0u8; 12];
                    info[0..2].copy_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
                    info[2..10].copy_from_slice(&export.size_bytes().to_be_bytes());
                    info[10..12].copy_from_slice(&export.transmission_flags().to_be_bytes());
                    send_reply(stream, option, NBD_REP_INFO, &info).await?;

                    // INFO_BLOCK_SIZE: min, preferred, max payload
                    let mut block = [0u8; 14];
                    block[0..2].copy_from_slice(&NBD_INFO_BLOCK_SIZE.to_be_bytes());
                    block[2..6].copy_from_slice(&NBD_MIN_BLOCK_SIZE.to_be_bytes());
                    block[6..10].copy_from_slice(&NBD_PREFERRED_BLOCK_SIZE.to_be_bytes());
                    block[10..14].copy_from_slice(&NBD_MAX_PAYLOAD_SIZE.to_be_bytes());
                    send_reply(stream, option, NBD_REP_INFO, &block).await?;

                    send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    if option == NBD_OPT_GO {
                        return Ok(true);
                    }
                }
                NBD_OPT_ABORT => {
                    send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                    return Ok(false);
                }
                NBD_OPT_LIST => {
                    let mut list = Vec::with_capacity(4 + export.name.len());
                    list.extend_from_slice(&(export.name.len() as u32).to_be_bytes());
                    list.extend_from_slice(export.name.as_bytes());
                    send_reply(stream, option, NBD_REP_SERVER, &list).await?;
                    send_reply(stream, option, NBD_REP_ACK, &[]).await?;
                }
                _ => {
                    send_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await?;
                }
            }
        }
    }

    async fn set_meta_context<S>(
        &self,
        stream: &mut S,
        session: &mut Session,
        data: &[u8],
    ) -> Result<(), NbdError>
    where
        S: AsyncWrite + Unpin,
    {
        let option = NBD_OPT_SET_META_CONTEXT;
        if !self.options.meta_contexts {
            return send_reply(stream, option, NBD_REP_ERR_UNSUP, &[]).await;
        }
        if !session.structured {
            return send_reply(stream, option, NBD_REP_ERR_INVALID, b"structured replies required")
                .await;
        }
        let Some(queries) = parse_meta_context_request(data) else {
            return send_reply(stream, option, NBD_REP_ERR_INVALID, &[]).await;
        };
        let (export_name, queries) = queries;
        if export_name != self.image.name {
            return send_reply(stream, option, NBD_REP_ERR_UNKNOWN, b"unknown export").await;
        }

        // A new SET_META_CONTEXT replaces whatever was selected before.
        session.contexts.clear();
        let mut granted = Vec::new();
        for query in queries {
            if self.image.context_map(&query).is_some() {
                granted.push(MetaContext {
                    id: granted.len() as u32 + 1,
                    name: query,
                });
            } else if self.options.context_policy == ContextPolicy::Reject {
                let message = format!("meta context {query} not available");
                return send_reply(stream, option, NBD_REP_ERR_UNKNOWN, message.as_bytes()).await;
            } else {
                debug!(context = %query, "omitting unknown meta context");
            }
        }

        for context in &granted {
            let mut reply = Vec::with_capacity(4 + context.name.len());
            reply.extend_from_slice(&context.id.to_be_bytes());
            reply.extend_from_slice(context.name.as_bytes());
            send_reply(stream, option, NBD_REP_META_CONTEXT, &reply).await?;
        }
        session.contexts = granted;
        send_reply(stream, option, NBD_REP_ACK, &[]).await
    }

    async fn transmission<S>(&self, stream: &mut S, session: &Session) -> Result<(), NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let export = &self.image;
        let mut req_buf = [0u8; NbdRequest::SIZE_BYTES];

        loop {
            match stream.read_exact(&mut req_buf).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }

            let req = match NbdRequest::from_bytes(&req_buf, export.size_bytes()) {
                Ok(req) => req,
                Err(NbdError::RequestTooLarge { .. }) => {
                    let handle = u64::from_be_bytes(req_buf[8..16].try_into().unwrap());
                    send_error(stream, session, handle, NBD_EOVERFLOW, "request too large").await?;
                    continue;
                }
                Err(NbdError::UnsupportedCommand { command }) => {
                    warn!(command, "unsupported command");
                    let handle = u64::from_be_bytes(req_buf[8..16].try_into().unwrap());
                    send_error(stream, session, handle, NBD_EINVAL, "unsupported command").await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let in_bounds = req
                .offset
                .checked_add(req.length as u64)
                .is_some_and(|end| end <= export.size_bytes());

            match req.command {
                NbdCommand::Read if !in_bounds => {
                    send_error(stream, session, req.handle, NBD_EINVAL, "read out of bounds").await?;
                }
                NbdCommand::Read => self.read(stream, session, &req).await?,
                NbdCommand::BlockStatus if !in_bounds || req.length == 0 => {
                    send_error(stream, session, req.handle, NBD_EINVAL, "invalid range").await?;
                }
                NbdCommand::BlockStatus if session.contexts.is_empty() => {
                    send_error(stream, session, req.handle, NBD_EINVAL, "no meta context").await?;
                }
                NbdCommand::BlockStatus => self.block_status(stream, session, &req).await?,
                NbdCommand::Flush => {
                    stream.write_all(&NbdReply::ok(req.handle).to_bytes()).await?;
                }
                NbdCommand::Disconnect => return Ok(()),
            }
        }
    }

    async fn read<S>(&self, stream: &mut S, session: &Session, req: &NbdRequest) -> Result<(), NbdError>
    where
        S: AsyncWrite + Unpin,
    {
        let start = req.offset as usize;
        let end = start + req.length as usize;

        if !session.structured {
            stream.write_all(&NbdReply::ok(req.handle).to_bytes()).await?;
            stream.write_all(&self.image.data[start..end]).await?;
            return Ok(());
        }

        // (chunk type, offset, length) in request order
        let mut chunks = Vec::new();
        let mut pos = req.offset;
        let split = self.options.read_chunk_bytes.unwrap_or(u32::MAX).max(1) as u64;
        for extent in extents_in_range(&self.image.allocation, req.offset, req.length as u64) {
            let ext_end = pos + extent.length as u64;
            if extent.is_hole() {
                chunks.push((NBD_REPLY_TYPE_OFFSET_HOLE, pos, extent.length as u64));
            } else {
                let mut at = pos;
                while at < ext_end {
                    let len = split.min(ext_end - at);
                    chunks.push((NBD_REPLY_TYPE_OFFSET_DATA, at, len));
                    at += len;
                }
            }
            pos = ext_end;
        }

        if chunks.is_empty() {
            return send_chunk(stream, NBD_REPLY_FLAG_DONE, NBD_REPLY_TYPE_NONE, req.handle, &[]).await;
        }

        let last = chunks.len() - 1;
        for (i, (chunk_type, offset, length)) in chunks.into_iter().enumerate() {
            let flags = if i == last { NBD_REPLY_FLAG_DONE } else { 0 };
            let mut payload = Vec::with_capacity(12);
            payload.extend_from_slice(&offset.to_be_bytes());
            if chunk_type == NBD_REPLY_TYPE_OFFSET_HOLE {
                payload.extend_from_slice(&(length as u32).to_be_bytes());
                send_chunk(stream, flags, chunk_type, req.handle, &payload).await?;
            } else {
                let data = &self.image.data[offset as usize..(offset + length) as usize];
                payload.extend_from_slice(data);
                send_chunk(stream, flags, chunk_type, req.handle, &payload).await?;
            }
        }
        Ok(())
    }

    async fn block_status<S>(
        &self,
        stream: &mut S,
        session: &Session,
        req: &NbdRequest,
    ) -> Result<(), NbdError>
    where
        S: AsyncWrite + Unpin,
    {
        let last = session.contexts.len() - 1;
        for (i, context) in session.contexts.iter().enumerate() {
            let map = self.image.context_map(&context.name).unwrap_or_default();
            let mut extents = extents_in_range(map, req.offset, req.length as u64);
            if (req.flags & NBD_CMD_FLAG_REQ_ONE) != 0 {
                extents.truncate(1);
            }
            if let Some(max) = self.options.max_extents_per_reply {
                extents.truncate(max.max(1));
            }

            let mut payload = Vec::with_capacity(4 + extents.len() * Extent::SIZE_BYTES);
            payload.extend_from_slice(&context.id.to_be_bytes());
            for extent in &extents {
                payload.extend_from_slice(&extent.length.to_be_bytes());
                payload.extend_from_slice(&extent.flags.to_be_bytes());
            }
            let flags = if i == last { NBD_REPLY_FLAG_DONE } else { 0 };
            send_chunk(stream, flags, NBD_REPLY_TYPE_BLOCK_STATUS, req.handle, &payload).await?;
        }
        Ok(())
    }
}

async fn handshake<S>(stream: &mut S) -> Result<bool, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; 18];
    hello[0..8].copy_from_slice(&NBD_MAGIC.to_be_bytes());
    hello[8..16].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
    let flags = NBD_FLAG_FIXED_NEWSTYLE | NBD_FLAG_NO_ZEROES;
    hello[16..18].copy_from_slice(&flags.to_be_bytes());
    stream.write_all(&hello).await?;

    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    let client_flags = u32::from_be_bytes(buf);

    if (client_flags & NBD_FLAG_C_FIXED_NEWSTYLE) == 0 {
        return Err(NbdError::NegotiationFailed {
            reason: "client must use fixed newstyle",
        });
    }

    Ok((client_flags & NBD_FLAG_C_NO_ZEROES) != 0)
}

/// Read a length-prefixed string, returning it and the remaining bytes.
fn read_string(data: &[u8]) -> Option<(String, &[u8])> {
    let len = u32::from_be_bytes(data.get(0..4)?.try_into().ok()?) as usize;
    let bytes = data.get(4..4 + len)?;
    Some((String::from_utf8_lossy(bytes).into_owned(), &data[4 + len..]))
}

fn parse_meta_context_request(data: &[u8]) -> Option<(String, Vec<String>)> {
    let (export_name, rest) = read_string(data)?;
    let count = u32::from_be_bytes(rest.get(0..4)?.try_into().ok()?);
    let mut rest = &rest[4..];
    let mut queries = Vec::new();
    for _ in 0..count {
        let (query, tail) = read_string(rest)?;
        queries.push(query);
        rest = tail;
    }
    Some((export_name, queries))
}

async fn send_reply<S>(
    stream: &mut S,
    option: u32,
    reply_type: u32,
    data: &[u8],
) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let mut header = [0u8; 20];
    header[0..8].copy_from_slice(&NBD_OPTION_REPLY_MAGIC.to_be_bytes());
    header[8..12].copy_from_slice(&option.to_be_bytes());
    header[12..16].copy_from_slice(&reply_type.to_be_bytes());
    header[16..20].copy_from_slice(&(data.len() as u32).to_be_bytes());
    stream.write_all(&header).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    Ok(())
}

async fn send_chunk<S>(
    stream: &mut S,
    flags: u16,
    chunk_type: u16,
    handle: u64,
    payload: &[u8],
) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let header = StructuredReplyHeader {
        flags,
        chunk_type,
        handle,
        length: payload.len() as u32,
    };
    stream.write_all(&header.to_bytes()).await?;
    if !payload.is_empty() {
        stream.write_all(payload).await?;
    }
    Ok(())
}

async fn send_error<S>(
    stream: &mut S,
    session: &Session,
    handle: u64,
    code: u32,
    message: &str,
) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    if !session.structured {
        stream.write_all(&NbdReply::error(handle, code).to_bytes()).await?;
        return Ok(());
    }
    let mut payload = Vec::with_capacity(6 + message.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&(message.len() as u16).to_be_bytes());
    payload.extend_from_slice(message.as_bytes());
    send_chunk(stream, NBD_REPLY_FLAG_DONE, NBD_REPLY_TYPE_ERROR, handle, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::NbdHandle;
    use tokio::io::duplex;

    const KIB: u32 = 1024;

    fn sparse_image() -> ExportImage {
        // 16 KiB: 4 KiB data, 8 KiB hole, 4 KiB data
        let mut data = vec![0u8; 16 * KIB as usize];
        data[..4096].fill(0xAA);
        data[12288..].fill(0xBB);
        ExportImage::new("disk0", data)
            .with_allocation(vec![
                Extent { length: 4 * KIB, flags: 0 },
                Extent { length: 8 * KIB, flags: NBD_STATE_HOLE | NBD_STATE_ZERO },
                Extent { length: 4 * KIB, flags: 0 },
            ])
            .with_bitmap(
                "cp1",
                vec![
                    Extent { length: 12 * KIB, flags: 0 },
                    Extent { length: 4 * KIB, flags: NBD_STATE_DIRTY },
                ],
            )
    }

    async fn connect(
        image: ExportImage,
        options: ServerOptions,
        contexts: &[&str],
    ) -> Result<crate::NbdClient<tokio::io::DuplexStream>, NbdError> {
        let (client_stream, server_stream) = duplex(1024 * 1024);
        let server = ExportServer::new(image, options);
        tokio::spawn(async move {
            let _ = server.serve(server_stream).await;
        });

        let mut handle = NbdHandle::new();
        for context in contexts {
            handle.add_meta_context(*context)?;
        }
        handle.set_export_name("disk0")?;
        handle.connect(client_stream).await
    }

    #[test]
    fn extents_in_range_clips_both_ends() {
        let map = sparse_image().allocation;
        let extents = extents_in_range(&map, 2048, 4096);
        assert_eq!(
            extents,
            vec![
                Extent { length: 2048, flags: 0 },
                Extent { length: 2048, flags: NBD_STATE_HOLE | NBD_STATE_ZERO },
            ]
        );
    }

    #[tokio::test]
    async fn go_reports_size_flags_and_block_size() {
        let client = connect(sparse_image(), ServerOptions::default(), &[])
            .await
            .unwrap();
        assert_eq!(client.size_bytes, 16 * KIB as u64);
        assert!(client.is_read_only());
        assert!(client.supports_flush());
        assert!(client.can_multi_conn());
        let block = client.block_size.unwrap();
        assert_eq!(block.preferred, NBD_PREFERRED_BLOCK_SIZE);
        assert_eq!(block.maximum, NBD_MAX_PAYLOAD_SIZE);
    }

    #[tokio::test]
    async fn unknown_export_is_rejected() {
        let (client_stream, server_stream) = duplex(64 * 1024);
        let server = ExportServer::new(sparse_image(), ServerOptions::default());
        tokio::spawn(async move {
            let _ = server.serve(server_stream).await;
        });
        let mut handle = NbdHandle::new();
        handle.set_export_name("disk9").unwrap();
        let result = handle.connect(client_stream).await;
        assert!(matches!(
            result,
            Err(NbdError::OptionRejected {
                option: NBD_OPT_GO,
                reply: NBD_REP_ERR_UNKNOWN,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn structured_read_fills_holes() {
        let options = ServerOptions {
            read_chunk_bytes: Some(1000),
            ..Default::default()
        };
        let mut client = connect(sparse_image(), options, &[]).await.unwrap();
        assert!(client.structured_replies());
        let data = client.read(2048, 12 * KIB).await.unwrap();
        assert_eq!(data.len(), 12 * KIB as usize);
        assert!(data[..2048].iter().all(|&b| b == 0xAA));
        assert!(data[2048..10240].iter().all(|&b| b == 0));
        assert!(data[10240..].iter().all(|&b| b == 0xBB));
    }

    #[tokio::test]
    async fn simple_read_without_structured_replies() {
        let options = ServerOptions {
            structured_replies: false,
            ..Default::default()
        };
        let mut client = connect(sparse_image(), options, &[BASE_ALLOCATION])
            .await
            .unwrap();
        assert!(!client.structured_replies());
        assert!(client.meta_contexts().is_empty());
        let data = client.read(12 * KIB as u64, 4 * KIB).await.unwrap();
        assert!(data.iter().all(|&b| b == 0xBB));
    }

    #[tokio::test]
    async fn read_out_of_bounds_is_server_error() {
        let mut client = connect(sparse_image(), ServerOptions::default(), &[])
            .await
            .unwrap();
        let result = client.read(15 * KIB as u64, 2 * KIB).await;
        assert!(matches!(
            result,
            Err(NbdError::ServerError { code: NBD_EINVAL, .. })
        ));
        // Connection stays usable after an error reply.
        assert_eq!(client.read(0, 16).await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn block_status_for_each_granted_context() {
        let bitmap = format!("{QEMU_DIRTY_BITMAP_PREFIX}cp1");
        let mut client = connect(
            sparse_image(),
            ServerOptions::default(),
            &[BASE_ALLOCATION, &bitmap],
        )
        .await
        .unwrap();
        assert_eq!(client.meta_contexts().len(), 2);

        let allocation = client
            .block_status(BASE_ALLOCATION, 0, 16 * KIB)
            .await
            .unwrap();
        assert_eq!(allocation.len(), 3);
        assert!(allocation[1].is_hole());

        let dirty = client.block_status(&bitmap, 0, 16 * KIB).await.unwrap();
        assert_eq!(dirty.len(), 2);
        assert!(!dirty[0].is_dirty());
        assert!(dirty[1].is_dirty());
    }

    #[tokio::test]
    async fn omit_policy_drops_unknown_context() {
        let mut client = connect(
            sparse_image(),
            ServerOptions::default(),
            &["qemu:dirty-bitmap:missing"],
        )
        .await
        .unwrap();
        assert!(client.meta_contexts().is_empty());
        let result = client
            .block_status("qemu:dirty-bitmap:missing", 0, 4096)
            .await;
        assert!(matches!(
            result,
            Err(NbdError::MetaContextNotNegotiated { .. })
        ));
    }

    #[tokio::test]
    async fn reject_policy_fails_negotiation() {
        let options = ServerOptions {
            context_policy: ContextPolicy::Reject,
            ..Default::default()
        };
        let result = connect(sparse_image(), options, &["qemu:dirty-bitmap:missing"]).await;
        assert!(matches!(
            result,
            Err(NbdError::OptionRejected {
                option: NBD_OPT_SET_META_CONTEXT,
                reply: NBD_REP_ERR_UNKNOWN,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn meta_contexts_unsupported_is_permissive() {
        let options = ServerOptions {
            meta_contexts: false,
            ..Default::default()
        };
        let client = connect(sparse_image(), options, &[BASE_ALLOCATION])
            .await
            .unwrap();
        assert!(client.structured_replies());
        assert!(client.meta_contexts().is_empty());
    }

    #[tokio::test]
    async fn flush_and_disconnect() {
        let mut client = connect(sparse_image(), ServerOptions::default(), &[])
            .await
            .unwrap();
        client.flush().await.unwrap();
        client.disconnect().await.unwrap();
    }
}
