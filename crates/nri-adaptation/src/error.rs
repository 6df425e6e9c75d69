use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the embedding runtime.
///
/// Non-fatal plugin failures are logged and swallowed inside the engine;
/// everything that reaches the runtime carries one of these kinds.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid engine construction, malformed configuration or a duplicate
    /// plugin identity.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket-level failure or an expired deadline talking to a plugin.
    /// The affected plugin handle is torn down.
    #[error("plugin {plugin:?}: {reason}")]
    Transport { plugin: String, reason: String },

    /// A plugin response that violates the protocol.
    #[error("plugin {plugin:?}: {reason}")]
    Protocol { plugin: String, reason: String },

    /// Two plugins claimed the same field without an intervening clear.
    #[error("plugins {first:?} and {second:?} both tried to set {what}")]
    Conflict {
        first: String,
        second: String,
        what: String,
    },

    /// A validator rejected the composed result.
    #[error("validation failed: plugin {plugin:?} rejected the adjustment: {reason}")]
    ValidationRejected { plugin: String, reason: String },

    /// A plugin listed as required is not connected.
    #[error("required plugin {plugin:?} is not connected")]
    RequiredPlugin { plugin: String },

    /// Error bubbled up verbatim from a runtime-supplied callback.
    #[error("runtime callback failed: {0}")]
    Callback(#[source] anyhow::Error),
}

impl Error {
    pub(crate) fn conflict(first: &str, second: &str, what: impl Into<String>) -> Self {
        Error::Conflict {
            first: first.to_string(),
            second: second.to_string(),
            what: what.into(),
        }
    }

    pub(crate) fn transport(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Transport {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Protocol {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }
}
