//! Error types for the fog node

use thiserror::Error;

/// Result type alias for fog node operations
pub type Result<T> = std::result::Result<T, Error>;

/// Reason an edge update was rejected by the aggregator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidUpdateReason {
    NoActiveRound,
    TimestampBeforeRound,
    BadWeights,
    NonPositiveSamples,
    DuplicateClient,
}

impl std::fmt::Display for InvalidUpdateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InvalidUpdateReason::NoActiveRound => "no_active_round",
            InvalidUpdateReason::TimestampBeforeRound => "timestamp_before_round",
            InvalidUpdateReason::BadWeights => "bad_weights",
            InvalidUpdateReason::NonPositiveSamples => "non_positive_samples",
            InvalidUpdateReason::DuplicateClient => "duplicate_client",
        };
        f.write_str(s)
    }
}

/// Fog node error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid update: {0}")]
    InvalidUpdate(InvalidUpdateReason),

    #[error("aggregation aborted: updates disagree on parameter shapes")]
    HeterogeneousShapes,

    #[error("cache entry too large: {size_bytes} bytes exceeds bound of {max_bytes} bytes")]
    TooLarge { size_bytes: u64, max_bytes: u64 },

    #[error("could not size cache entry for serialization: {0}")]
    SerializationError(String),

    #[error("edge device registry is at capacity ({max} devices)")]
    CapacityExceeded { max: usize },

    #[error("device {0} is already registered")]
    AlreadyRegistered(String),

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("unknown workload: {0}")]
    UnknownWorkload(String),

    #[error("workload {0} is already terminal")]
    AlreadyTerminal(String),

    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("toml parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
}
