//! NBD protocol constants and types.
//!
//! Based on https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! Protocol constants are defined for completeness even if not all are currently used.

#![allow(dead_code)]

use std::io;

use thiserror::Error;

/// IANA-registered NBD port.
pub const NBD_DEFAULT_PORT: u16 = 10809;

// Magic values
pub const NBD_MAGIC: u64 = 0x4e42444d41474943;
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub const NBD_STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;
pub const NBD_OPTION_REPLY_MAGIC: u64 = 0x0003e889045565a9;

// Handshake flags
pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

// Client flags
pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

// Transmission flags
pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;
pub const NBD_FLAG_SEND_FUA: u16 = 1 << 3;
pub const NBD_FLAG_ROTATIONAL: u16 = 1 << 4;
pub const NBD_FLAG_SEND_TRIM: u16 = 1 << 5;
pub const NBD_FLAG_SEND_WRITE_ZEROES: u16 = 1 << 6;
pub const NBD_FLAG_SEND_DF: u16 = 1 << 7;
pub const NBD_FLAG_CAN_MULTI_CONN: u16 = 1 << 8;
pub const NBD_FLAG_SEND_CACHE: u16 = 1 << 10;

// Option types
pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_STARTTLS: u32 = 5;
pub const NBD_OPT_INFO: u32 = 6;
pub const NBD_OPT_GO: u32 = 7;
pub const NBD_OPT_STRUCTURED_REPLY: u32 = 8;
pub const NBD_OPT_LIST_META_CONTEXT: u32 = 9;
pub const NBD_OPT_SET_META_CONTEXT: u32 = 10;

// Option replies
pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;
pub const NBD_REP_META_CONTEXT: u32 = 4;
pub const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
pub const NBD_REP_ERR_UNSUP: u32 = NBD_REP_FLAG_ERROR + 1;
pub const NBD_REP_ERR_POLICY: u32 = NBD_REP_FLAG_ERROR + 2;
pub const NBD_REP_ERR_INVALID: u32 = NBD_REP_FLAG_ERROR + 3;
pub const NBD_REP_ERR_PLATFORM: u32 = NBD_REP_FLAG_ERROR + 4;
pub const NBD_REP_ERR_TLS_REQD: u32 = NBD_REP_FLAG_ERROR + 5;
pub const NBD_REP_ERR_UNKNOWN: u32 = NBD_REP_FLAG_ERROR + 6;
pub const NBD_REP_ERR_SHUTDOWN: u32 = NBD_REP_FLAG_ERROR + 7;
pub const NBD_REP_ERR_BLOCK_SIZE_REQD: u32 = NBD_REP_FLAG_ERROR + 8;
pub const NBD_REP_ERR_TOO_BIG: u32 = NBD_REP_FLAG_ERROR + 9;

// Info types
pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_NAME: u16 = 1;
pub const NBD_INFO_DESCRIPTION: u16 = 2;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

/// Minimum block size (1 byte).
///
/// Most flexible; clients may align to 512 for portability.
pub const NBD_MIN_BLOCK_SIZE: u32 = 1;

/// Maximum payload size per NBD protocol specification (32 MiB).
///
/// This is the default maximum that portable clients expect servers to support.
/// It bounds memory allocation for READ buffers.
///
/// Note: BLOCK_STATUS carries no payload and may describe ranges larger
/// than this limit.
pub const NBD_MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024; // 32 MiB

/// Maximum length of export names and meta context names.
pub const NBD_MAX_STRING_BYTES: usize = 4096;

/// Well-known meta context describing allocation (holes and zeroes).
pub const BASE_ALLOCATION: &str = "base:allocation";

/// Namespace prefix qemu uses to expose persistent dirty bitmaps.
pub const QEMU_DIRTY_BITMAP_PREFIX: &str = "qemu:dirty-bitmap:";

// `base:allocation` extent flags
pub const NBD_STATE_HOLE: u32 = 1 << 0;
pub const NBD_STATE_ZERO: u32 = 1 << 1;

// `qemu:dirty-bitmap:*` extent flags
pub const NBD_STATE_DIRTY: u32 = 1 << 0;

// Commands
pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_DISCONNECT: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;
pub const NBD_CMD_BLOCK_STATUS: u16 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NbdCommand {
    Read,
    Disconnect,
    Flush,
    BlockStatus,
}

impl NbdCommand {
    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            NBD_CMD_READ => Some(Self::Read),
            NBD_CMD_DISCONNECT => Some(Self::Disconnect),
            NBD_CMD_FLUSH => Some(Self::Flush),
            NBD_CMD_BLOCK_STATUS => Some(Self::BlockStatus),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::Read => NBD_CMD_READ,
            Self::Disconnect => NBD_CMD_DISCONNECT,
            Self::Flush => NBD_CMD_FLUSH,
            Self::BlockStatus => NBD_CMD_BLOCK_STATUS,
        }
    }
}

pub const NBD_CMD_FLAG_FUA: u16 = 1 << 0;
pub const NBD_CMD_FLAG_NO_HOLE: u16 = 1 << 1;
pub const NBD_CMD_FLAG_DF: u16 = 1 << 2;
pub const NBD_CMD_FLAG_REQ_ONE: u16 = 1 << 3;

// Structured reply flags and chunk types
pub const NBD_REPLY_FLAG_DONE: u16 = 1 << 0;
pub const NBD_REPLY_TYPE_NONE: u16 = 0;
pub const NBD_REPLY_TYPE_OFFSET_DATA: u16 = 1;
pub const NBD_REPLY_TYPE_OFFSET_HOLE: u16 = 2;
pub const NBD_REPLY_TYPE_BLOCK_STATUS: u16 = 5;
pub const NBD_REPLY_TYPE_ERROR: u16 = (1 << 15) + 1;
pub const NBD_REPLY_TYPE_ERROR_OFFSET: u16 = (1 << 15) + 2;

// Error codes
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;
pub const NBD_EOVERFLOW: u32 = 75;
pub const NBD_ENOTSUP: u32 = 95;
pub const NBD_ESHUTDOWN: u32 = 108;

/// Maximum length for option reply data during negotiation.
/// This prevents unbounded allocation from malicious servers.
pub const OPTION_REPLY_MAX_BYTES: usize = 64 * 1024; // 64 KiB

/// Maximum length of a non-data structured reply chunk (block status, errors).
pub const STRUCTURED_CHUNK_MAX_BYTES: usize = 16 * 1024 * 1024; // 16 MiB

/// Human readable name of an option reply code, for diagnostics.
pub fn reply_name(reply: u32) -> &'static str {
    match reply {
        NBD_REP_ACK => "ACK",
        NBD_REP_SERVER => "SERVER",
        NBD_REP_INFO => "INFO",
        NBD_REP_META_CONTEXT => "META_CONTEXT",
        NBD_REP_ERR_UNSUP => "ERR_UNSUP",
        NBD_REP_ERR_POLICY => "ERR_POLICY",
        NBD_REP_ERR_INVALID => "ERR_INVALID",
        NBD_REP_ERR_PLATFORM => "ERR_PLATFORM",
        NBD_REP_ERR_TLS_REQD => "ERR_TLS_REQD",
        NBD_REP_ERR_UNKNOWN => "ERR_UNKNOWN",
        NBD_REP_ERR_SHUTDOWN => "ERR_SHUTDOWN",
        NBD_REP_ERR_BLOCK_SIZE_REQD => "ERR_BLOCK_SIZE_REQD",
        NBD_REP_ERR_TOO_BIG => "ERR_TOO_BIG",
        _ => "UNKNOWN",
    }
}

/// Human readable name of an option code, for diagnostics.
pub fn option_name(option: u32) -> &'static str {
    match option {
        NBD_OPT_EXPORT_NAME => "EXPORT_NAME",
        NBD_OPT_ABORT => "ABORT",
        NBD_OPT_LIST => "LIST",
        NBD_OPT_STARTTLS => "STARTTLS",
        NBD_OPT_INFO => "INFO",
        NBD_OPT_GO => "GO",
        NBD_OPT_STRUCTURED_REPLY => "STRUCTURED_REPLY",
        NBD_OPT_LIST_META_CONTEXT => "LIST_META_CONTEXT",
        NBD_OPT_SET_META_CONTEXT => "SET_META_CONTEXT",
        _ => "UNKNOWN",
    }
}

/// NBD protocol errors.
#[derive(Debug, Error)]
pub enum NbdError {
    #[error("invalid magic: expected 0x{expected:08x}, got 0x{actual:08x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("protocol negotiation failed: {reason}")]
    NegotiationFailed { reason: &'static str },

    #[error("server rejected NBD_OPT_{}: NBD_REP_{}{}", opt_label(.option), rep_label(.reply), fmt_message(.message))]
    OptionRejected {
        option: u32,
        reply: u32,
        message: String,
    },

    #[error("invalid {what}: {reason}")]
    InvalidName {
        what: &'static str,
        reason: &'static str,
    },

    #[error("an export name is required before connecting")]
    ExportNameRequired,

    #[error("malformed reply: {reason}")]
    MalformedReply { reason: &'static str },

    #[error("unsupported command: {command}")]
    UnsupportedCommand { command: u16 },

    #[error("unexpected structured reply chunk type {chunk_type}")]
    UnexpectedChunk { chunk_type: u16 },

    #[error("meta context not negotiated: {name}")]
    MetaContextNotNegotiated { name: String },

    #[error("request too large: {length_bytes} bytes (max: {max_bytes})")]
    RequestTooLarge { length_bytes: u32, max_bytes: u32 },

    #[error("server error: {code}{}", fmt_message(.message))]
    ServerError { code: u32, message: String },

    #[error("handle mismatch: expected {expected}, got {actual}")]
    HandleMismatch { expected: u64, actual: u64 },

    #[error("failed to connect to {address}: {source}")]
    Connect { address: String, source: io::Error },

    #[error("transmission error: {0}")]
    Io(#[from] io::Error),
}

fn opt_label(option: &u32) -> &'static str {
    option_name(*option)
}

fn rep_label(reply: &u32) -> &'static str {
    reply_name(*reply)
}

fn fmt_message(message: &str) -> String {
    if message.is_empty() {
        String::new()
    } else {
        format!(" ({message})")
    }
}

impl NbdError {
    pub(crate) fn server(code: u32) -> Self {
        Self::ServerError {
            code,
            message: String::new(),
        }
    }
}

/// Validate an export or meta context name before it goes on the wire.
pub fn validate_name(what: &'static str, name: &str) -> Result<(), NbdError> {
    if name.len() > NBD_MAX_STRING_BYTES {
        return Err(NbdError::InvalidName {
            what,
            reason: "longer than 4096 bytes",
        });
    }
    if name.contains('\0') {
        return Err(NbdError::InvalidName {
            what,
            reason: "contains a NUL byte",
        });
    }
    Ok(())
}

/// A meta context the server agreed to provide.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaContext {
    /// Server-chosen identifier used in BLOCK_STATUS replies.
    pub id: u32,
    pub name: String,
}

/// Block size constraints from `NBD_INFO_BLOCK_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSize {
    pub minimum: u32,
    pub preferred: u32,
    pub maximum: u32,
}

/// One block status descriptor: a run of `length` bytes sharing `flags`.
///
/// Flag meaning depends on the context: see `NBD_STATE_HOLE`,
/// `NBD_STATE_ZERO` and `NBD_STATE_DIRTY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub length: u32,
    pub flags: u32,
}

impl Extent {
    pub const SIZE_BYTES: usize = 8;

    pub fn is_hole(&self) -> bool {
        (self.flags & NBD_STATE_HOLE) != 0
    }

    pub fn is_zero(&self) -> bool {
        (self.flags & NBD_STATE_ZERO) != 0
    }

    /// Only meaningful for `qemu:dirty-bitmap:*` contexts.
    pub fn is_dirty(&self) -> bool {
        (self.flags & NBD_STATE_DIRTY) != 0
    }
}

/// NBD request (28 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct NbdRequest {
    pub flags: u16,
    pub command: NbdCommand,
    pub handle: u64,
    pub offset: u64,
    /// Request length, validated based on command type:
    /// - Read: bounded by NBD_MAX_PAYLOAD_SIZE (data transfer)
    /// - BlockStatus: bounded by device size (no data transfer)
    pub length: u32,
}

impl NbdRequest {
    pub const SIZE_BYTES: usize = 28;

    /// Serialize an NBD request to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&self.command.to_u16().to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse and validate an NBD request.
    ///
    /// Length validation depends on command type per NBD spec:
    /// - Commands that transfer data (Read) are limited to `NBD_MAX_PAYLOAD_SIZE`
    /// - BlockStatus describes a range without data transfer and may exceed
    ///   the max payload size, bounded only by device size
    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES], device_size: u64) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_REQUEST_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_REQUEST_MAGIC,
                actual: magic,
            });
        }

        let flags = u16::from_be_bytes([buf[4], buf[5]]);
        let cmd = u16::from_be_bytes([buf[6], buf[7]]);
        let command =
            NbdCommand::from_u16(cmd).ok_or(NbdError::UnsupportedCommand { command: cmd })?;
        let handle = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        let offset = u64::from_be_bytes(buf[16..24].try_into().unwrap());
        let length = u32::from_be_bytes(buf[24..28].try_into().unwrap());

        let max_length = match command {
            NbdCommand::Read => NBD_MAX_PAYLOAD_SIZE,
            NbdCommand::BlockStatus => device_size.min(u32::MAX as u64) as u32,
            NbdCommand::Disconnect | NbdCommand::Flush => u32::MAX,
        };

        if length > max_length {
            return Err(NbdError::RequestTooLarge {
                length_bytes: length,
                max_bytes: max_length,
            });
        }

        Ok(Self {
            flags,
            command,
            handle,
            offset,
            length,
        })
    }
}

/// Simple NBD reply (16 bytes on wire).
#[derive(Debug, Clone, Copy)]
pub struct NbdReply {
    pub error: u32,
    pub handle: u64,
}

impl NbdReply {
    pub const SIZE_BYTES: usize = 16;

    pub fn ok(handle: u64) -> Self {
        Self {
            error: NBD_OK,
            handle,
        }
    }

    pub fn error(handle: u64, error: u32) -> Self {
        Self { error, handle }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_SIMPLE_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_SIMPLE_REPLY_MAGIC,
                actual: magic,
            });
        }

        let error = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let handle = u64::from_be_bytes(buf[8..16].try_into().unwrap());
        Ok(Self { error, handle })
    }
}

/// Structured reply chunk header (20 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructuredReplyHeader {
    pub flags: u16,
    pub chunk_type: u16,
    pub handle: u64,
    pub length: u32,
}

impl StructuredReplyHeader {
    pub const SIZE_BYTES: usize = 20;

    pub fn is_done(&self) -> bool {
        (self.flags & NBD_REPLY_FLAG_DONE) != 0
    }

    pub fn is_error(&self) -> bool {
        (self.chunk_type & (1 << 15)) != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..4].copy_from_slice(&NBD_STRUCTURED_REPLY_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&self.chunk_type.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf[16..20].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE_BYTES]) -> Result<Self, NbdError> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != NBD_STRUCTURED_REPLY_MAGIC {
            return Err(NbdError::InvalidMagic {
                expected: NBD_STRUCTURED_REPLY_MAGIC,
                actual: magic,
            });
        }
        Ok(Self {
            flags: u16::from_be_bytes([buf[4], buf[5]]),
            chunk_type: u16::from_be_bytes([buf[6], buf[7]]),
            handle: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            length: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
        })
    }
}

/// Parse the payload of an `NBD_REPLY_TYPE_ERROR[_OFFSET]` chunk.
pub fn parse_error_chunk(payload: &[u8]) -> Result<(u32, String), NbdError> {
    if payload.len() < 6 {
        return Err(NbdError::MalformedReply {
            reason: "short structured error chunk",
        });
    }
    let code = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let msg_len = u16::from_be_bytes(payload[4..6].try_into().unwrap()) as usize;
    let msg = payload
        .get(6..6 + msg_len)
        .map(|m| String::from_utf8_lossy(m).into_owned())
        .unwrap_or_default();
    Ok((code, msg))
}

/// Parse the payload of an `NBD_REPLY_TYPE_BLOCK_STATUS` chunk.
pub fn parse_block_status_chunk(payload: &[u8]) -> Result<(u32, Vec<Extent>), NbdError> {
    if payload.len() < 4 || (payload.len() - 4) % Extent::SIZE_BYTES != 0 {
        return Err(NbdError::MalformedReply {
            reason: "block status chunk is not a whole number of descriptors",
        });
    }
    let context_id = u32::from_be_bytes(payload[0..4].try_into().unwrap());
    let extents = payload[4..]
        .chunks_exact(Extent::SIZE_BYTES)
        .map(|d| Extent {
            length: u32::from_be_bytes(d[0..4].try_into().unwrap()),
            flags: u32::from_be_bytes(d[4..8].try_into().unwrap()),
        })
        .collect();
    Ok((context_id, extents))
}

const _: () = {
    assert!(NbdRequest::SIZE_BYTES == 28);
    assert!(NbdReply::SIZE_BYTES == 16);
    assert!(StructuredReplyHeader::SIZE_BYTES == 20);
};
