//! Error types for nbdbackup.

use std::io;
use thiserror::Error;

// Re-export NbdError from the nbd crate
pub use nbd::NbdError;

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// Protocol engine errors are carried unchanged; the variant only records
/// whether they happened while connecting or afterwards.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Handshake(NbdError),

    #[error(transparent)]
    Transmission(NbdError),

    #[error("meta context {name} was not granted by the server")]
    MetaContextNotGranted { name: String },
}

/// Coarse classification callers use to decide what to do with a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid parameters, correctable by the caller before connecting.
    Configuration,
    /// Transport could not be established. Worth retrying with backoff.
    Connection,
    /// Server refused the export or a capability.
    Negotiation,
    /// Failure after the handshake completed.
    Transmission,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Configuration,
            Self::Handshake(NbdError::Connect { .. }) => ErrorKind::Connection,
            Self::Handshake(NbdError::InvalidName { .. } | NbdError::ExportNameRequired) => {
                ErrorKind::Configuration
            }
            Self::Handshake(_) | Self::MetaContextNotGranted { .. } => ErrorKind::Negotiation,
            Self::Transmission(_) => ErrorKind::Transmission,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Connection
    }

    /// The underlying protocol engine error, if any.
    pub fn nbd(&self) -> Option<&NbdError> {
        match self {
            Self::Handshake(e) | Self::Transmission(e) => Some(e),
            _ => None,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::from(ConfigError::InvalidValue {
            field: "export_name",
            reason: "must not be empty",
        });
        assert!(err.to_string().contains("export_name"));
    }

    #[test]
    fn engine_errors_keep_their_message() {
        let engine = NbdError::NegotiationFailed {
            reason: "invalid opts magic",
        };
        let expected = engine.to_string();
        let err = Error::Handshake(engine);
        assert_eq!(err.to_string(), expected);
        assert!(matches!(
            err.nbd(),
            Some(NbdError::NegotiationFailed { .. })
        ));
    }

    #[test]
    fn kind_classification() {
        let connect = Error::Handshake(NbdError::Connect {
            address: "localhost:1".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        });
        assert_eq!(connect.kind(), ErrorKind::Connection);
        assert!(connect.is_retryable());

        let missing = Error::Handshake(NbdError::ExportNameRequired);
        assert_eq!(missing.kind(), ErrorKind::Configuration);

        let refused = Error::Handshake(NbdError::OptionRejected {
            option: nbd::NBD_OPT_GO,
            reply: nbd::NBD_REP_ERR_UNKNOWN,
            message: String::new(),
        });
        assert_eq!(refused.kind(), ErrorKind::Negotiation);
        assert!(!refused.is_retryable());

        // The same engine error after connect is a transmission failure.
        let io = Error::Transmission(NbdError::Io(io::Error::from(io::ErrorKind::BrokenPipe)));
        assert_eq!(io.kind(), ErrorKind::Transmission);
        assert!(!io.is_retryable());
    }
}
