use crate::codec::CodecError;

/// Startup-time configuration and coin-profile errors. Any of these aborts
/// the process before the stratum listener is bound.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unknown coin family '{0}' (expected bitcoin or zcash)")]
    UnknownFamily(String),

    #[error("unknown proof-of-work algorithm '{0}'")]
    UnknownAlgorithm(String),

    #[error("pool address is not configured")]
    MissingPoolAddress,

    #[error("coin '{coin}' needs a founders address table")]
    MissingFounders { coin: String },

    #[error("coin '{coin}' needs a persona for zhash")]
    MissingPersona { coin: String },

    #[error("invalid {field}: {source}")]
    InvalidAddress {
        field: &'static str,
        #[source]
        source: CodecError,
    },

    #[error("invalid pow limit '{0}'")]
    InvalidPowLimit(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("failed to read config file {path}: {reason}")]
    File { path: String, reason: String },
}
