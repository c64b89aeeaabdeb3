//! Crate-wide error types (§7, §10.2): one `thiserror`-derived enum per concern, wrapped
//! by a top-level [`ProxyError`] that `main` renders with `Display`.

use std::io;

pub use dbus_proxy_wire::WireError;

/// Configuration-class errors (§7): rejected at startup, process exits non-zero.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("filter rule name {0:?} begins with ':' (unique names cannot be filter names)")]
    UniqueNameAsFilterName(String),

    #[error("malformed call/broadcast rule {0:?}")]
    MalformedRule(String),

    #[error("socket path {0:?} is invalid")]
    BadSocketPath(String),

    #[error("upstream bus address is empty")]
    EmptyBusAddress,
}

/// Top-level error returned from `main` (§10.2).
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] io::Error),
}
