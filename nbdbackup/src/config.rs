//! Export connection configuration.

use std::fmt;

use nbd::{BASE_ALLOCATION, NBD_DEFAULT_PORT, NBD_MAX_STRING_BYTES, QEMU_DIRTY_BITMAP_PREFIX};
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where to connect and what to negotiate.
///
/// Every field except `export_name` has a default, so a config file may be
/// as small as `export_name = "vda"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportConfig {
    pub export_name: String,
    #[serde(default = "default_host")]
    pub host: String,
    /// Accepts a TOML integer or string.
    #[serde(default = "default_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    #[serde(default = "default_meta_context")]
    pub meta_context: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    NBD_DEFAULT_PORT
}

fn default_meta_context() -> String {
    BASE_ALLOCATION.to_string()
}

impl ExportConfig {
    /// Config for `export_name` with every other field defaulted.
    pub fn new(export_name: impl Into<String>) -> Self {
        Self {
            export_name: export_name.into(),
            host: default_host(),
            port: default_port(),
            meta_context: default_meta_context(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_meta_context(mut self, meta_context: impl Into<String>) -> Self {
        self.meta_context = meta_context.into();
        self
    }

    /// Request the qemu dirty bitmap of `checkpoint` instead of allocation.
    pub fn with_dirty_bitmap(self, checkpoint: &str) -> Self {
        self.with_meta_context(format!("{QEMU_DIRTY_BITMAP_PREFIX}{checkpoint}"))
    }

    /// `host:port`, as used in logs and connection errors.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_wire_string("export_name", &self.export_name)?;
        validate_wire_string("meta_context", &self.meta_context)?;
        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "host",
                reason: "must not be empty",
            });
        }
        if self.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "port",
                reason: "must be > 0",
            });
        }
        Ok(())
    }

    /// Load and validate a TOML config file.
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: ExportConfig =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_wire_string(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.len() > NBD_MAX_STRING_BYTES {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "longer than 4096 bytes",
        });
    }
    if value.contains('\0') {
        return Err(ConfigError::InvalidValue {
            field,
            reason: "contains a NUL byte",
        });
    }
    Ok(())
}

/// Parse a port given as text, e.g. `"10809"`.
pub fn parse_port(value: &str) -> Result<u16, ConfigError> {
    match value.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(ConfigError::InvalidValue {
            field: "port",
            reason: "must be an integer between 1 and 65535",
        }),
        Ok(port) => Ok(port),
    }
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    struct PortVisitor;

    impl Visitor<'_> for PortVisitor {
        type Value = u16;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a TCP port as an integer or string")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u16, E> {
            u16::try_from(v).map_err(|_| E::custom(format!("port out of range: {v}")))
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u16, E> {
            u16::try_from(v).map_err(|_| E::custom(format!("port out of range: {v}")))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u16, E> {
            v.trim()
                .parse()
                .map_err(|_| E::custom(format!("invalid port: {v:?}")))
        }
    }

    deserializer.deserialize_any(PortVisitor)
}
