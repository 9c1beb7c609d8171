use thiserror::Error;

/// Errors surfaced by the host core.
///
/// Recoverable conditions never propagate out of the audio thread; there
/// they degrade to pass-through and show up as counters the control
/// surface can read.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("unknown plugin URI: {0}")]
    UnknownPlugin(String),

    #[error("plugin requires unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("failed to instantiate plugin: {0}")]
    InstantiationFailed(String),

    #[error("no space left in ring buffer")]
    NoSpace,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("state i/o failed: {0}")]
    StateIo(String),
}

pub type Result<T> = std::result::Result<T, HostError>;
