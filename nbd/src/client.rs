//! NBD client implementation.
//!
//! [`NbdHandle`] collects the negotiation parameters (export name, meta
//! contexts) and is consumed by `connect`, which runs the fixed-newstyle
//! handshake and yields a connected [`NbdClient`]. A handle can therefore
//! only ever be connected once.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::protocol::*;

/// Unconnected NBD handle.
///
/// Options are sent in a fixed order during `connect`: structured replies,
/// then `SET_META_CONTEXT` with every registered context, then `GO` for the
/// export. Contexts therefore have to be registered before connecting.
#[derive(Debug, Clone)]
pub struct NbdHandle {
    export_name: Option<String>,
    meta_contexts: Vec<String>,
    request_structured_replies: bool,
    request_block_size: bool,
}

impl Default for NbdHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl NbdHandle {
    pub fn new() -> Self {
        Self {
            export_name: None,
            meta_contexts: Vec::new(),
            request_structured_replies: true,
            request_block_size: true,
        }
    }

    /// Request a meta context during negotiation.
    pub fn add_meta_context(&mut self, name: impl Into<String>) -> Result<(), NbdError> {
        let name = name.into();
        if name.is_empty() {
            return Err(NbdError::InvalidName {
                what: "meta context",
                reason: "must not be empty",
            });
        }
        validate_name("meta context", &name)?;
        self.meta_contexts.push(name);
        Ok(())
    }

    /// Select the export to attach to.
    pub fn set_export_name(&mut self, name: impl Into<String>) -> Result<(), NbdError> {
        let name = name.into();
        validate_name("export name", &name)?;
        self.export_name = Some(name);
        Ok(())
    }

    /// Whether to negotiate structured replies. Meta contexts need them,
    /// so disabling this also skips `SET_META_CONTEXT`.
    pub fn set_request_structured_replies(&mut self, request: bool) {
        self.request_structured_replies = request;
    }

    /// Whether to ask the server for its block size constraints during `GO`.
    pub fn set_request_block_size(&mut self, request: bool) {
        self.request_block_size = request;
    }

    pub fn export_name(&self) -> Option<&str> {
        self.export_name.as_deref()
    }

    pub fn meta_contexts(&self) -> &[String] {
        &self.meta_contexts
    }

    /// Open a TCP connection to `host:port` and negotiate the export.
    pub async fn connect_tcp(self, host: &str, port: u16) -> Result<NbdClient<TcpStream>, NbdError> {
        let connect_error = |source: io::Error| NbdError::Connect {
            address: format!("{host}:{port}"),
            source,
        };
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(connect_error)?;
        stream.set_nodelay(true).map_err(connect_error)?;
        self.connect(stream).await
    }

    /// Negotiate the export over an already established stream.
    pub async fn connect<S>(self, mut stream: S) -> Result<NbdClient<S>, NbdError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let export_name = match self.export_name {
            Some(name) if !name.is_empty() => name,
            _ => return Err(NbdError::ExportNameRequired),
        };

        let no_zeroes = read_greeting(&mut stream).await?;
        let client_flags =
            NBD_FLAG_C_FIXED_NEWSTYLE | if no_zeroes { NBD_FLAG_C_NO_ZEROES } else { 0 };
        stream.write_all(&client_flags.to_be_bytes()).await?;

        let structured_replies = if self.request_structured_replies {
            negotiate_structured_replies(&mut stream).await?
        } else {
            false
        };

        let meta_contexts = if structured_replies && !self.meta_contexts.is_empty() {
            negotiate_meta_contexts(&mut stream, &export_name, &self.meta_contexts).await?
        } else {
            if !self.meta_contexts.is_empty() {
                warn!(
                    export = %export_name,
                    "server lacks structured replies, meta contexts not requested"
                );
            }
            Vec::new()
        };

        let export = negotiate_go(&mut stream, &export_name, self.request_block_size).await?;

        debug!(
            export = %export_name,
            size_bytes = export.size_bytes,
            transmission_flags = export.transmission_flags,
            structured_replies,
            contexts = meta_contexts.len(),
            "NBD handshake complete"
        );

        Ok(NbdClient {
            stream,
            handle_counter: AtomicU64::new(0),
            size_bytes: export.size_bytes,
            transmission_flags: export.transmission_flags,
            block_size: export.block_size,
            export_name,
            meta_contexts,
            structured_replies,
        })
    }
}

async fn read_greeting<S>(stream: &mut S) -> Result<bool, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut hello = [0u8; 18];
    stream.read_exact(&mut hello).await?;

    let magic = u64::from_be_bytes(hello[0..8].try_into().unwrap());
    if magic != NBD_MAGIC {
        return Err(NbdError::InvalidMagic {
            expected: NBD_MAGIC as u32,
            actual: magic as u32,
        });
    }

    let opts_magic = u64::from_be_bytes(hello[8..16].try_into().unwrap());
    if opts_magic != NBD_OPTS_MAGIC {
        return Err(NbdError::NegotiationFailed {
            reason: "invalid opts magic",
        });
    }

    let flags = u16::from_be_bytes(hello[16..18].try_into().unwrap());
    if (flags & NBD_FLAG_FIXED_NEWSTYLE) == 0 {
        return Err(NbdError::NegotiationFailed {
            reason: "server does not support fixed newstyle negotiation",
        });
    }
    Ok((flags & NBD_FLAG_NO_ZEROES) != 0)
}

async fn send_option<S>(stream: &mut S, option: u32, data: &[u8]) -> Result<(), NbdError>
where
    S: AsyncWrite + Unpin,
{
    let mut header = [0u8; 16];
    header[0..8].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
    header[8..12].copy_from_slice(&option.to_be_bytes());
    header[12..16].copy_from_slice(&(data.len() as u32).to_be_bytes());
    stream.write_all(&header).await?;
    if !data.is_empty() {
        stream.write_all(data).await?;
    }
    stream.flush().await?;
    Ok(())
}

struct OptionReply {
    reply_type: u32,
    data: Vec<u8>,
}

impl OptionReply {
    fn is_error(&self) -> bool {
        (self.reply_type & NBD_REP_FLAG_ERROR) != 0
    }

    fn rejected(self, option: u32) -> NbdError {
        NbdError::OptionRejected {
            option,
            reply: self.reply_type,
            message: String::from_utf8_lossy(&self.data).into_owned(),
        }
    }
}

async fn read_option_reply<S>(stream: &mut S, option: u32) -> Result<OptionReply, NbdError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 20];
    stream.read_exact(&mut header).await?;

    let magic = u64::from_be_bytes(header[0..8].try_into().unwrap());
    if magic != NBD_OPTION_REPLY_MAGIC {
        return Err(NbdError::InvalidMagic {
            expected: NBD_OPTION_REPLY_MAGIC as u32,
            actual: magic as u32,
        });
    }

    let replied_to = u32::from_be_bytes(header[8..12].try_into().unwrap());
    if replied_to != option {
        return Err(NbdError::NegotiationFailed {
            reason: "option reply for a different option",
        });
    }

    let reply_type = u32::from_be_bytes(header[12..16].try_into().unwrap());
    let reply_len = u32::from_be_bytes(header[16..20].try_into().unwrap()) as usize;

    // Bound allocation to prevent DoS from malicious servers
    if reply_len > OPTION_REPLY_MAX_BYTES {
        return Err(NbdError::RequestTooLarge {
            length_bytes: reply_len as u32,
            max_bytes: OPTION_REPLY_MAX_BYTES as u32,
        });
    }

    let mut data = vec![0u8; reply_len];
    stream.read_exact(&mut data).await?;
    debug!(
        option = option_name(option),
        reply = reply_name(reply_type),
        length = reply_len,
        "NBD option reply"
    );
    Ok(OptionReply { reply_type, data })
}

async fn negotiate_structured_replies<S>(stream: &mut S) -> Result<bool, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    send_option(stream, NBD_OPT_STRUCTURED_REPLY, &[]).await?;
    let reply = read_option_reply(stream, NBD_OPT_STRUCTURED_REPLY).await?;
    match reply.reply_type {
        NBD_REP_ACK => Ok(true),
        _ if reply.is_error() => {
            debug!(
                reply = reply_name(reply.reply_type),
                "structured replies refused"
            );
            Ok(false)
        }
        _ => Err(NbdError::NegotiationFailed {
            reason: "unexpected reply to NBD_OPT_STRUCTURED_REPLY",
        }),
    }
}

fn push_string(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

async fn negotiate_meta_contexts<S>(
    stream: &mut S,
    export_name: &str,
    queries: &[String],
) -> Result<Vec<MetaContext>, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut data = Vec::new();
    push_string(&mut data, export_name);
    data.extend_from_slice(&(queries.len() as u32).to_be_bytes());
    for query in queries {
        push_string(&mut data, query);
    }
    send_option(stream, NBD_OPT_SET_META_CONTEXT, &data).await?;

    let mut granted = Vec::new();
    loop {
        let reply = read_option_reply(stream, NBD_OPT_SET_META_CONTEXT).await?;
        match reply.reply_type {
            NBD_REP_META_CONTEXT => {
                if reply.data.len() < 4 {
                    return Err(NbdError::MalformedReply {
                        reason: "short NBD_REP_META_CONTEXT",
                    });
                }
                let id = u32::from_be_bytes(reply.data[0..4].try_into().unwrap());
                let name = String::from_utf8_lossy(&reply.data[4..]).into_owned();
                debug!(id, name = %name, "meta context granted");
                granted.push(MetaContext { id, name });
            }
            NBD_REP_ACK => return Ok(granted),
            NBD_REP_ERR_UNSUP => {
                debug!("server does not support meta contexts");
                return Ok(Vec::new());
            }
            _ if reply.is_error() => {
                return Err(reply.rejected(NBD_OPT_SET_META_CONTEXT));
            }
            _ => {
                return Err(NbdError::NegotiationFailed {
                    reason: "unexpected reply to NBD_OPT_SET_META_CONTEXT",
                });
            }
        }
    }
}

struct ExportInfo {
    size_bytes: u64,
    transmission_flags: u16,
    block_size: Option<BlockSize>,
}

async fn negotiate_go<S>(
    stream: &mut S,
    export_name: &str,
    request_block_size: bool,
) -> Result<ExportInfo, NbdError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut data = Vec::with_capacity(4 + export_name.len() + 4);
    push_string(&mut data, export_name);
    if request_block_size {
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&NBD_INFO_BLOCK_SIZE.to_be_bytes());
    } else {
        data.extend_from_slice(&0u16.to_be_bytes());
    }
    send_option(stream, NBD_OPT_GO, &data).await?;

    let mut export: Option<(u64, u16)> = None;
    let mut block_size = None;
    loop {
        let reply = read_option_reply(stream, NBD_OPT_GO).await?;
        match reply.reply_type {
            NBD_REP_INFO if reply.data.len() >= 2 => {
                let info_type = u16::from_be_bytes(reply.data[0..2].try_into().unwrap());
                match info_type {
                    NBD_INFO_EXPORT if reply.data.len() >= 12 => {
                        let size = u64::from_be_bytes(reply.data[2..10].try_into().unwrap());
                        let flags = u16::from_be_bytes(reply.data[10..12].try_into().unwrap());
                        export = Some((size, flags));
                    }
                    NBD_INFO_BLOCK_SIZE if reply.data.len() >= 14 => {
                        block_size = Some(BlockSize {
                            minimum: u32::from_be_bytes(reply.data[2..6].try_into().unwrap()),
                            preferred: u32::from_be_bytes(reply.data[6..10].try_into().unwrap()),
                            maximum: u32::from_be_bytes(reply.data[10..14].try_into().unwrap()),
                        });
                    }
                    other => debug!(info_type = other, "ignoring NBD_REP_INFO"),
                }
            }
            NBD_REP_ACK => {
                let (size_bytes, transmission_flags) = export.ok_or(NbdError::NegotiationFailed {
                    reason: "server acknowledged NBD_OPT_GO without NBD_INFO_EXPORT",
                })?;
                return Ok(ExportInfo {
                    size_bytes,
                    transmission_flags,
                    block_size,
                });
            }
            _ if reply.is_error() => return Err(reply.rejected(NBD_OPT_GO)),
            _ => {
                return Err(NbdError::NegotiationFailed {
                    reason: "unexpected reply to NBD_OPT_GO",
                });
            }
        }
    }
}

/// Header of the next reply from the server.
enum ReplyHeader {
    Simple(NbdReply),
    Structured(StructuredReplyHeader),
}

/// NBD client for a negotiated export.
pub struct NbdClient<S> {
    stream: S,
    handle_counter: AtomicU64,
    /// Size of the export in bytes.
    pub size_bytes: u64,
    /// Transmission flags advertised by the server.
    pub transmission_flags: u16,
    /// Block size constraints, if the server advertised them.
    pub block_size: Option<BlockSize>,
    export_name: String,
    meta_contexts: Vec<MetaContext>,
    structured_replies: bool,
}

impl<S> NbdClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Name of the export this client is attached to.
    pub fn export_name(&self) -> &str {
        &self.export_name
    }

    /// Meta contexts the server granted during negotiation.
    pub fn meta_contexts(&self) -> &[MetaContext] {
        &self.meta_contexts
    }

    pub fn meta_context_id(&self, name: &str) -> Option<u32> {
        self.meta_contexts
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id)
    }

    pub fn structured_replies(&self) -> bool {
        self.structured_replies
    }

    fn next_handle(&self) -> u64 {
        self.handle_counter.fetch_add(1, Ordering::SeqCst)
    }

    async fn send_request(
        &mut self,
        command: NbdCommand,
        flags: u16,
        offset: u64,
        length: u32,
    ) -> Result<u64, NbdError> {
        let handle = self.next_handle();
        let req = NbdRequest {
            flags,
            command,
            handle,
            offset,
            length,
        };
        self.stream.write_all(&req.to_bytes()).await?;
        self.stream.flush().await?;
        Ok(handle)
    }

    async fn read_reply_header(&mut self, expected: u64) -> Result<ReplyHeader, NbdError> {
        let mut magic = [0u8; 4];
        self.stream.read_exact(&mut magic).await?;
        let header = match u32::from_be_bytes(magic) {
            NBD_SIMPLE_REPLY_MAGIC => {
                let mut buf = [0u8; NbdReply::SIZE_BYTES];
                buf[0..4].copy_from_slice(&magic);
                self.stream.read_exact(&mut buf[4..]).await?;
                ReplyHeader::Simple(NbdReply::from_bytes(&buf)?)
            }
            NBD_STRUCTURED_REPLY_MAGIC if self.structured_replies => {
                let mut buf = [0u8; StructuredReplyHeader::SIZE_BYTES];
                buf[0..4].copy_from_slice(&magic);
                self.stream.read_exact(&mut buf[4..]).await?;
                ReplyHeader::Structured(StructuredReplyHeader::from_bytes(&buf)?)
            }
            actual => {
                return Err(NbdError::InvalidMagic {
                    expected: NBD_SIMPLE_REPLY_MAGIC,
                    actual,
                });
            }
        };

        let actual = match &header {
            ReplyHeader::Simple(reply) => reply.handle,
            ReplyHeader::Structured(chunk) => chunk.handle,
        };
        if actual != expected {
            return Err(NbdError::HandleMismatch { expected, actual });
        }
        Ok(header)
    }

    async fn read_chunk_payload(&mut self, length: u32) -> Result<Vec<u8>, NbdError> {
        if length as usize > STRUCTURED_CHUNK_MAX_BYTES {
            return Err(NbdError::RequestTooLarge {
                length_bytes: length,
                max_bytes: STRUCTURED_CHUNK_MAX_BYTES as u32,
            });
        }
        let mut payload = vec![0u8; length as usize];
        self.stream.read_exact(&mut payload).await?;
        Ok(payload)
    }

    /// Read a reply that carries no payload (FLUSH and friends).
    async fn read_empty_reply(&mut self, handle: u64) -> Result<(), NbdError> {
        let mut error: Option<NbdError> = None;
        loop {
            match self.read_reply_header(handle).await? {
                ReplyHeader::Simple(reply) => {
                    if reply.error != NBD_OK {
                        return Err(NbdError::server(reply.error));
                    }
                    return Ok(());
                }
                ReplyHeader::Structured(chunk) => {
                    let payload = self.read_chunk_payload(chunk.length).await?;
                    if chunk.is_error() {
                        let (code, message) = parse_error_chunk(&payload)?;
                        error.get_or_insert(NbdError::ServerError { code, message });
                    } else if chunk.chunk_type != NBD_REPLY_TYPE_NONE {
                        error.get_or_insert(NbdError::UnexpectedChunk {
                            chunk_type: chunk.chunk_type,
                        });
                    }
                    if chunk.is_done() {
                        return error.map_or(Ok(()), Err);
                    }
                }
            }
        }
    }

    /// Read data from the export.
    ///
    /// Holes reported through structured replies are returned as zeroes.
    pub async fn read(&mut self, offset: u64, length: u32) -> Result<Bytes, NbdError> {
        if length > NBD_MAX_PAYLOAD_SIZE {
            return Err(NbdError::RequestTooLarge {
                length_bytes: length,
                max_bytes: NBD_MAX_PAYLOAD_SIZE,
            });
        }
        let handle = self
            .send_request(NbdCommand::Read, 0, offset, length)
            .await?;

        let mut data = BytesMut::with_capacity(length as usize);
        data.resize(length as usize, 0);
        let mut error: Option<NbdError> = None;
        let mut covered = Coverage::default();

        loop {
            match self.read_reply_header(handle).await? {
                ReplyHeader::Simple(reply) => {
                    if reply.error != NBD_OK {
                        return Err(NbdError::server(reply.error));
                    }
                    self.stream.read_exact(&mut data).await.map_err(|e| {
                        NbdError::Io(io::Error::other(format!(
                            "failed to read {} bytes of response data at offset {}: {}",
                            length, offset, e
                        )))
                    })?;
                    return Ok(data.freeze());
                }
                ReplyHeader::Structured(chunk) => {
                    match chunk.chunk_type {
                        NBD_REPLY_TYPE_OFFSET_DATA => {
                            if chunk.length < 8 {
                                return Err(NbdError::MalformedReply {
                                    reason: "short NBD_REPLY_TYPE_OFFSET_DATA",
                                });
                            }
                            let mut buf = [0u8; 8];
                            self.stream.read_exact(&mut buf).await?;
                            let chunk_offset = u64::from_be_bytes(buf);
                            let range = chunk_range(offset, length, chunk_offset, chunk.length - 8)?;
                            self.stream.read_exact(&mut data[range.clone()]).await?;
                            covered.push(range);
                        }
                        NBD_REPLY_TYPE_OFFSET_HOLE => {
                            let payload = self.read_chunk_payload(chunk.length).await?;
                            if payload.len() != 12 {
                                return Err(NbdError::MalformedReply {
                                    reason: "NBD_REPLY_TYPE_OFFSET_HOLE must be 12 bytes",
                                });
                            }
                            let hole_offset = u64::from_be_bytes(payload[0..8].try_into().unwrap());
                            let hole_len = u32::from_be_bytes(payload[8..12].try_into().unwrap());
                            let range = chunk_range(offset, length, hole_offset, hole_len)?;
                            data[range.clone()].fill(0);
                            covered.push(range);
                        }
                        NBD_REPLY_TYPE_NONE => {
                            self.read_chunk_payload(chunk.length).await?;
                        }
                        _ if chunk.is_error() => {
                            let payload = self.read_chunk_payload(chunk.length).await?;
                            let (code, message) = parse_error_chunk(&payload)?;
                            error.get_or_insert(NbdError::ServerError { code, message });
                        }
                        other => {
                            return Err(NbdError::UnexpectedChunk { chunk_type: other });
                        }
                    }
                    if chunk.is_done() {
                        if let Some(e) = error.take() {
                            return Err(e);
                        }
                        if !covered.is_complete(length as usize) {
                            return Err(NbdError::MalformedReply {
                                reason: "read reply does not cover the requested range",
                            });
                        }
                        return Ok(data.freeze());
                    }
                }
            }
        }
    }

    /// Query block status for a granted meta context.
    ///
    /// The server may describe less than `length` bytes; callers covering a
    /// range loop until the extents add up to it.
    pub async fn block_status(
        &mut self,
        context: &str,
        offset: u64,
        length: u32,
    ) -> Result<Vec<Extent>, NbdError> {
        let context_id =
            self.meta_context_id(context)
                .ok_or_else(|| NbdError::MetaContextNotNegotiated {
                    name: context.to_string(),
                })?;
        let handle = self
            .send_request(NbdCommand::BlockStatus, 0, offset, length)
            .await?;

        let mut extents = Vec::new();
        let mut error: Option<NbdError> = None;
        loop {
            match self.read_reply_header(handle).await? {
                ReplyHeader::Simple(reply) => {
                    // Only valid for errors once structured replies are on.
                    let code = if reply.error == NBD_OK {
                        NBD_EINVAL
                    } else {
                        reply.error
                    };
                    return Err(NbdError::server(code));
                }
                ReplyHeader::Structured(chunk) => {
                    let payload = self.read_chunk_payload(chunk.length).await?;
                    match chunk.chunk_type {
                        NBD_REPLY_TYPE_BLOCK_STATUS => {
                            let (id, descriptors) = parse_block_status_chunk(&payload)?;
                            if id == context_id {
                                extents.extend(descriptors);
                            }
                        }
                        NBD_REPLY_TYPE_NONE => {}
                        _ if chunk.is_error() => {
                            let (code, message) = parse_error_chunk(&payload)?;
                            error.get_or_insert(NbdError::ServerError { code, message });
                        }
                        other => {
                            error.get_or_insert(NbdError::UnexpectedChunk { chunk_type: other });
                        }
                    }
                    if chunk.is_done() {
                        return match error {
                            Some(e) => Err(e),
                            None => Ok(extents),
                        };
                    }
                }
            }
        }
    }

    /// Flush pending writes on the server side.
    pub async fn flush(&mut self) -> Result<(), NbdError> {
        let handle = self.send_request(NbdCommand::Flush, 0, 0, 0).await?;
        self.read_empty_reply(handle).await
    }

    /// Disconnect from the server.
    pub async fn disconnect(mut self) -> Result<(), NbdError> {
        self.send_request(NbdCommand::Disconnect, 0, 0, 0).await?;
        self.stream.shutdown().await?;
        Ok(())
    }

    /// Check if the server supports flush.
    pub fn supports_flush(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_SEND_FLUSH) != 0
    }

    /// Check if the export is read-only.
    pub fn is_read_only(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_READ_ONLY) != 0
    }

    /// Check if the server allows several connections to the same export.
    pub fn can_multi_conn(&self) -> bool {
        (self.transmission_flags & NBD_FLAG_CAN_MULTI_CONN) != 0
    }
}

/// Map a chunk's absolute range into the request buffer.
fn chunk_range(
    req_offset: u64,
    req_length: u32,
    chunk_offset: u64,
    chunk_length: u32,
) -> Result<std::ops::Range<usize>, NbdError> {
    let start = chunk_offset
        .checked_sub(req_offset)
        .ok_or(NbdError::MalformedReply {
            reason: "chunk starts before the requested offset",
        })?;
    let end = start
        .checked_add(chunk_length as u64)
        .ok_or(NbdError::MalformedReply {
            reason: "chunk extends past the requested range",
        })?;
    if end > req_length as u64 {
        return Err(NbdError::MalformedReply {
            reason: "chunk extends past the requested range",
        });
    }
    Ok(start as usize..end as usize)
}

/// Byte ranges of a structured READ reply filled by data and hole chunks.
#[derive(Default)]
struct Coverage {
    ranges: Vec<std::ops::Range<usize>>,
}

impl Coverage {
    fn push(&mut self, range: std::ops::Range<usize>) {
        self.ranges.push(range);
    }

    /// True when the chunks tile `0..length` exactly, without gaps or overlap.
    fn is_complete(&mut self, length: usize) -> bool {
        self.ranges.sort_by_key(|r| r.start);
        let mut pos = 0;
        for range in &self.ranges {
            if range.start != pos {
                return false;
            }
            pos = range.end;
        }
        pos == length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_rejects_empty_meta_context() {
        let mut handle = NbdHandle::new();
        let result = handle.add_meta_context("");
        assert!(matches!(result, Err(NbdError::InvalidName { .. })));
        assert!(handle.meta_contexts().is_empty());
    }

    #[test]
    fn handle_keeps_context_order() {
        let mut handle = NbdHandle::new();
        handle.add_meta_context(BASE_ALLOCATION).unwrap();
        handle.add_meta_context("qemu:dirty-bitmap:cp1").unwrap();
        assert_eq!(
            handle.meta_contexts(),
            &[BASE_ALLOCATION.to_string(), "qemu:dirty-bitmap:cp1".to_string()]
        );
    }

    #[tokio::test]
    async fn connect_without_export_name_fails_before_io() {
        let (client, _server) = tokio::io::duplex(64);
        let result = NbdHandle::new().connect(client).await;
        assert!(matches!(result, Err(NbdError::ExportNameRequired)));
    }

    #[tokio::test]
    async fn connect_rejects_oldstyle_server() {
        let (client, mut server) = tokio::io::duplex(64);
        let mut hello = [0u8; 18];
        hello[0..8].copy_from_slice(&NBD_MAGIC.to_be_bytes());
        hello[8..16].copy_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        server.write_all(&hello).await.unwrap();

        let mut handle = NbdHandle::new();
        handle.set_export_name("disk0").unwrap();
        let result = handle.connect(client).await;
        assert!(matches!(result, Err(NbdError::NegotiationFailed { .. })));
    }

    #[tokio::test]
    async fn connect_tcp_failure_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut handle = NbdHandle::new();
        handle.set_export_name("disk0").unwrap();
        match handle.connect_tcp("127.0.0.1", port).await {
            Err(NbdError::Connect { address, .. }) => {
                assert_eq!(address, format!("127.0.0.1:{port}"));
            }
            Err(other) => panic!("expected Connect, got {other}"),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[test]
    fn chunk_range_bounds() {
        assert_eq!(chunk_range(100, 50, 110, 10).unwrap(), 10..20);
        assert!(chunk_range(100, 50, 90, 10).is_err());
        assert!(chunk_range(100, 50, 140, 20).is_err());
        assert!(matches!(
            chunk_range(0, 4096, u64::MAX, 16),
            Err(NbdError::MalformedReply { .. })
        ));
    }

    #[test]
    fn coverage_requires_exact_tiling() {
        let mut full = Coverage::default();
        full.push(100..200);
        full.push(0..100);
        assert!(full.is_complete(200));

        let mut gap = Coverage::default();
        gap.push(0..100);
        gap.push(150..200);
        assert!(!gap.is_complete(200));

        let mut overlap = Coverage::default();
        overlap.push(0..120);
        overlap.push(100..200);
        assert!(!overlap.is_complete(200));

        assert!(Coverage::default().is_complete(0));
        assert!(!Coverage::default().is_complete(4096));
    }

    async fn write_option_reply<S: AsyncWrite + Unpin>(
        server: &mut S,
        option: u32,
        reply_type: u32,
        data: &[u8],
    ) {
        let mut buf = Vec::with_capacity(20 + data.len());
        buf.extend_from_slice(&NBD_OPTION_REPLY_MAGIC.to_be_bytes());
        buf.extend_from_slice(&option.to_be_bytes());
        buf.extend_from_slice(&reply_type.to_be_bytes());
        buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
        buf.extend_from_slice(data);
        server.write_all(&buf).await.unwrap();
    }

    async fn skip_option<S: AsyncRead + Unpin>(server: &mut S) -> u32 {
        let mut header = [0u8; 16];
        server.read_exact(&mut header).await.unwrap();
        let option = u32::from_be_bytes(header[8..12].try_into().unwrap());
        let len = u32::from_be_bytes(header[12..16].try_into().unwrap());
        let mut data = vec![0u8; len as usize];
        server.read_exact(&mut data).await.unwrap();
        option
    }

    /// Minimal server side of a handshake with structured replies and a
    /// 1 MiB export; returns once `GO` is acknowledged.
    async fn accept_structured<S: AsyncRead + AsyncWrite + Unpin>(server: &mut S) {
        let mut hello = Vec::with_capacity(18);
        hello.extend_from_slice(&NBD_MAGIC.to_be_bytes());
        hello.extend_from_slice(&NBD_OPTS_MAGIC.to_be_bytes());
        hello.extend_from_slice(&NBD_FLAG_FIXED_NEWSTYLE.to_be_bytes());
        server.write_all(&hello).await.unwrap();
        let mut client_flags = [0u8; 4];
        server.read_exact(&mut client_flags).await.unwrap();

        assert_eq!(skip_option(server).await, NBD_OPT_STRUCTURED_REPLY);
        write_option_reply(server, NBD_OPT_STRUCTURED_REPLY, NBD_REP_ACK, &[]).await;

        assert_eq!(skip_option(server).await, NBD_OPT_GO);
        let mut info = Vec::with_capacity(12);
        info.extend_from_slice(&NBD_INFO_EXPORT.to_be_bytes());
        info.extend_from_slice(&(1024u64 * 1024).to_be_bytes());
        info.extend_from_slice(&0u16.to_be_bytes());
        write_option_reply(server, NBD_OPT_GO, NBD_REP_INFO, &info).await;
        write_option_reply(server, NBD_OPT_GO, NBD_REP_ACK, &[]).await;
    }

    async fn read_request<S: AsyncRead + Unpin>(server: &mut S) -> NbdRequest {
        let mut buf = [0u8; NbdRequest::SIZE_BYTES];
        server.read_exact(&mut buf).await.unwrap();
        NbdRequest::from_bytes(&buf, 1024 * 1024).unwrap()
    }

    async fn connected(
        client: tokio::io::DuplexStream,
    ) -> NbdClient<tokio::io::DuplexStream> {
        let mut handle = NbdHandle::new();
        handle.set_export_name("disk0").unwrap();
        handle.connect(client).await.unwrap()
    }

    #[tokio::test]
    async fn read_rejects_reply_without_data() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            accept_structured(&mut server).await;
            let req = read_request(&mut server).await;
            let done = StructuredReplyHeader {
                flags: NBD_REPLY_FLAG_DONE,
                chunk_type: NBD_REPLY_TYPE_NONE,
                handle: req.handle,
                length: 0,
            };
            server.write_all(&done.to_bytes()).await.unwrap();
            server
        });

        let mut nbd = connected(client).await;
        assert!(nbd.structured_replies());
        let result = nbd.read(0, 4096).await;
        assert!(matches!(result, Err(NbdError::MalformedReply { .. })));
        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn read_rejects_partial_coverage() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            accept_structured(&mut server).await;
            let req = read_request(&mut server).await;
            let data = StructuredReplyHeader {
                flags: NBD_REPLY_FLAG_DONE,
                chunk_type: NBD_REPLY_TYPE_OFFSET_DATA,
                handle: req.handle,
                length: 8 + 1024,
            };
            server.write_all(&data.to_bytes()).await.unwrap();
            server.write_all(&req.offset.to_be_bytes()).await.unwrap();
            server.write_all(&[0xab; 1024]).await.unwrap();
            server
        });

        let mut nbd = connected(client).await;
        let result = nbd.read(0, 4096).await;
        assert!(matches!(result, Err(NbdError::MalformedReply { .. })));
        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn read_rejects_hole_at_end_of_address_space() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            accept_structured(&mut server).await;
            let req = read_request(&mut server).await;
            let hole = StructuredReplyHeader {
                flags: NBD_REPLY_FLAG_DONE,
                chunk_type: NBD_REPLY_TYPE_OFFSET_HOLE,
                handle: req.handle,
                length: 12,
            };
            server.write_all(&hole.to_bytes()).await.unwrap();
            server.write_all(&u64::MAX.to_be_bytes()).await.unwrap();
            server.write_all(&16u32.to_be_bytes()).await.unwrap();
            server
        });

        let mut nbd = connected(client).await;
        let result = nbd.read(0, 4096).await;
        assert!(matches!(result, Err(NbdError::MalformedReply { .. })));
        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn read_accepts_data_and_hole_chunks() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(async move {
            accept_structured(&mut server).await;
            let req = read_request(&mut server).await;
            let hole = StructuredReplyHeader {
                flags: 0,
                chunk_type: NBD_REPLY_TYPE_OFFSET_HOLE,
                handle: req.handle,
                length: 12,
            };
            server.write_all(&hole.to_bytes()).await.unwrap();
            server.write_all(&(req.offset + 2048).to_be_bytes()).await.unwrap();
            server.write_all(&2048u32.to_be_bytes()).await.unwrap();
            let data = StructuredReplyHeader {
                flags: NBD_REPLY_FLAG_DONE,
                chunk_type: NBD_REPLY_TYPE_OFFSET_DATA,
                handle: req.handle,
                length: 8 + 2048,
            };
            server.write_all(&data.to_bytes()).await.unwrap();
            server.write_all(&req.offset.to_be_bytes()).await.unwrap();
            server.write_all(&[0xab; 2048]).await.unwrap();
            server
        });

        let mut nbd = connected(client).await;
        let data = nbd.read(4096, 4096).await.unwrap();
        assert!(data[..2048].iter().all(|&b| b == 0xab));
        assert!(data[2048..].iter().all(|&b| b == 0));
        drop(server_task.await.unwrap());
    }
}
