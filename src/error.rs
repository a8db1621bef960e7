use thiserror::Error;

/// Main error type for the allocation engine
#[derive(Error, Debug)]
pub enum ContractNetError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {}", .0.join("; "))]
    InvalidConfig(Vec<String>),

    // Input validation errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid scoring weights: {0}")]
    InvalidWeights(String),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Runtime errors
    #[error("Protocol is not running")]
    NotRunning,

    #[error("No tokio runtime available to schedule {0}")]
    NoRuntime(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl ContractNetError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ContractNetError::InvalidInput(msg.into())
    }
}

/// Result type alias for ContractNetError
pub type Result<T> = std::result::Result<T, ContractNetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_joins_messages() {
        let err = ContractNetError::InvalidConfig(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Invalid configuration: a; b");
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = ContractNetError::InvalidStateTransition {
            from: "awarded".into(),
            to: "announced".into(),
        };
        assert!(err.to_string().contains("awarded"));
        assert!(err.to_string().contains("announced"));
    }
}
