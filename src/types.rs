use serde::{Deserialize, Serialize};

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("in use: {0}")]
    InUse(String),

    #[error("type coercion: {0}")]
    TypeCoercion(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("already bound: {0}")]
    AlreadyBound(String),

    #[error("ambiguous output: {0}")]
    AmbiguousOutput(String),

    #[error("unknown block type: {0}")]
    UnknownType(String),

    #[error("unknown port: {0}")]
    UnknownPort(String),

    #[error("block execution: {0}")]
    BlockExecution(String),

    #[error("gateway: {0}")]
    Gateway(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("runtime stopped")]
    RuntimeStopped,
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl Error {
    /// Stable error kind tag used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "not-found",
            Error::Conflict(_) => "conflict",
            Error::InUse(_) => "in-use",
            Error::TypeCoercion(_) => "type-coercion",
            Error::InvalidAddress(_) => "invalid-address",
            Error::AlreadyBound(_) => "already-bound",
            Error::AmbiguousOutput(_) => "ambiguous-output",
            Error::UnknownType(_) => "unknown-type",
            Error::UnknownPort(_) => "unknown-port",
            Error::BlockExecution(_) => "block-execution",
            Error::Gateway(_) | Error::Io(_) => "io-failure",
            Error::Timeout(_) => "timeout",
            Error::RuntimeStopped => "io-failure",
        }
    }
}

/// Where a bus write came from. Part of every telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    KnxIn,
    Api,
    BlockOut,
    IkoInternal,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::KnxIn => write!(f, "knx-in"),
            Origin::Api => write!(f, "api"),
            Origin::BlockOut => write!(f, "block-out"),
            Origin::IkoInternal => write!(f, "iko-internal"),
        }
    }
}

/// Which side of a block a binding attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

/// Block instance lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    Restoring,
    Ready,
    Executing,
    Disabled,
}
