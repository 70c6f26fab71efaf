use crate::message::ResultMessage;

/// Every distinguishable failure mode the bus client can surface.
///
/// Each variant corresponds to one of the error kinds enumerated in the
/// core specification; callers are expected to match on these rather than
/// on formatted strings.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid parameters for {canonical_name}: {reason}")]
    InvalidParameters {
        canonical_name: String,
        reason: String,
    },

    #[error(
        "invalid event arguments for {canonical_name}: expected {{{expected}}}, got {{{got}}}"
    )]
    InvalidEventArguments {
        canonical_name: String,
        expected: String,
        got: String,
    },

    #[error("listener is not a valid event listener: {reason}")]
    InvalidEventListener { reason: &'static str },

    #[error("unknown API '{api_name}'")]
    UnknownApi { api_name: String },

    #[error("API '{api_name}' has no event named '{event_name}'")]
    EventNotFound {
        api_name: String,
        event_name: String,
    },

    #[error("no transport registered for api '{api_name}' kind {kind} and no default configured")]
    NoTransport { api_name: String, kind: &'static str },

    #[error("consume_rpcs called with no APIs to serve")]
    NoApisToListenOn,

    #[error("RPC {canonical_name} timed out after {timeout_secs:.3}s")]
    Timeout {
        canonical_name: String,
        timeout_secs: f64,
    },

    #[error("remote error calling {canonical_name}: {message}{}", trace.as_deref().map(|t| format!("\nremote trace:\n{t}")).unwrap_or_default())]
    ServerError {
        canonical_name: String,
        message: String,
        trace: Option<String>,
    },

    #[error("schema validation failed for {canonical_name} ({direction}): {message}")]
    Validation {
        canonical_name: String,
        direction: &'static str,
        message: String,
    },

    #[error("no schema found for '{name}' on API '{api_name}'")]
    SchemaNotFound { api_name: String, name: String },

    #[error("invalid bus node configuration: {reason}")]
    InvalidBusNodeConfiguration { reason: &'static str },

    #[error("'{operation}' is only available on the root bus node")]
    OnlyAvailableOnRootNode { operation: &'static str },

    /// Test-only fault injection. Never surfaced to users as a normal
    /// result: the local RPC consumer loop detects this variant and drops
    /// the call without emitting a result message, matching
    /// `SuddenDeathException` in the reference implementation.
    #[error("sudden death (test fault injection)")]
    SuddenDeath,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("schema (de)serialization error: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn server_error_from_result(canonical_name: impl Into<String>, result: &ResultMessage) -> Self {
        Error::ServerError {
            canonical_name: canonical_name.into(),
            message: result.result.as_str().map(str::to_string).unwrap_or_else(|| result.result.to_string()),
            trace: result.trace.clone(),
        }
    }

    /// `true` for the two error kinds that must propagate through the local
    /// RPC execution handler unconverted, rather than being turned into an
    /// error `ResultMessage`.
    pub fn is_propagate_only(&self) -> bool {
        matches!(self, Error::SuddenDeath | Error::Cancelled)
    }
}
