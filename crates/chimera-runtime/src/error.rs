//! Error types for the bridge runtime.

use chimera_types::{DescriptorError, WireError};

/// Caller-facing failure of a bridge operation.
///
/// Every variant maps to a stable code string (see [`BridgeError::code`]),
/// which is what generated clients on the script side switch on.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BridgeError {
    /// The engine has not reached `Ready`, failed to start, or was destroyed
    #[error("Engine is not ready")]
    Initialization,

    /// The embedded side has no handler for the requested name
    #[error("Method {0} not implemented by the embedded runtime")]
    NotImplemented(String),

    /// The embedded handler ran and reported a failure
    #[error("{code}: {message}")]
    Remote {
        code: String,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// The channel went away while the call was outstanding
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Unknown future method: {0}")]
    UnknownMethod(String),

    #[error("Unknown stream: {0}")]
    UnknownStream(String),

    #[error("Invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },

    #[error("Failed to decode result: {0}")]
    Decode(String),

    #[error("Failed to spawn confinement thread: {0}")]
    SpawnFailed(String),

    #[error("Invalid module config: {0}")]
    Config(String),
}

impl BridgeError {
    pub const INIT_ERROR: &'static str = "INIT_ERROR";
    pub const NOT_IMPLEMENTED: &'static str = "NOT_IMPLEMENTED";
    pub const TRANSPORT_ERROR: &'static str = "TRANSPORT_ERROR";

    /// Code string reported to the caller.
    ///
    /// Remote errors keep the code the embedded handler chose.
    pub fn code(&self) -> &str {
        match self {
            BridgeError::Initialization => Self::INIT_ERROR,
            BridgeError::NotImplemented(_) => Self::NOT_IMPLEMENTED,
            BridgeError::Remote { code, .. } => code,
            BridgeError::Transport(_) => Self::TRANSPORT_ERROR,
            BridgeError::UnknownMethod(_) => "UNKNOWN_METHOD",
            BridgeError::UnknownStream(_) => "UNKNOWN_STREAM",
            BridgeError::InvalidArguments { .. } => "INVALID_ARGUMENTS",
            BridgeError::Decode(_) => "DECODE_ERROR",
            BridgeError::SpawnFailed(_) => "SPAWN_ERROR",
            BridgeError::Config(_) => "CONFIG_ERROR",
        }
    }

    /// Message reported to the caller alongside [`BridgeError::code`]
    pub fn message(&self) -> String {
        match self {
            BridgeError::Remote { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<ConfigError> for BridgeError {
    fn from(err: ConfigError) -> Self {
        BridgeError::Config(err.to_string())
    }
}

impl From<TransportError> for BridgeError {
    fn from(err: TransportError) -> Self {
        BridgeError::Transport(err.to_string())
    }
}

/// Failures of the channel itself, as opposed to a handler's answer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Channel closed")]
    Closed,

    #[error("Reply for unknown correlation id {0}")]
    UnknownCorrelation(u64),

    #[error(transparent)]
    Wire(#[from] WireError),
}

/// Errors raised while creating or running the embedded engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Engine creation failed: {0}")]
    CreateFailed(String),

    #[error("Entrypoint failed: {0}")]
    Entrypoint(String),

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("Engine is in state {0} and cannot be started")]
    InvalidState(crate::engine::EngineState),

    #[error("Failed to spawn engine thread: {0}")]
    SpawnFailed(#[from] std::io::Error),
}

/// Errors loading a bridge configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Module name must not be empty")]
    MissingName,

    #[error("Invalid descriptors: {0}")]
    Descriptors(#[from] DescriptorError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(BridgeError::Initialization.code(), "INIT_ERROR");
        assert_eq!(BridgeError::NotImplemented("ghost".into()).code(), "NOT_IMPLEMENTED");
        assert_eq!(BridgeError::from(TransportError::Closed).code(), "TRANSPORT_ERROR");

        let remote = BridgeError::Remote {
            code: "E1".into(),
            message: "boom".into(),
            details: None,
        };
        assert_eq!(remote.code(), "E1");
        assert_eq!(remote.message(), "boom");
    }

    #[test]
    fn test_not_implemented_names_method() {
        let err = BridgeError::NotImplemented("ghost".into());
        assert!(err.message().contains("ghost"));
    }
}
