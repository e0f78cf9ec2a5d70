use thiserror::Error;

use crate::ProviderType;

/// Failures that no amount of retrying can fix: the cluster descriptor or
/// the account behind it is wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unsupported provider: {0}")]
    UnsupportedProvider(String),
    #[error("no secret found for access key {0}")]
    MissingCredential(String),
    #[error("credential lookup for access key {access_key} failed: {reason}")]
    Credential { access_key: String, reason: String },
    #[error("invalid cluster config: {0}")]
    InvalidCluster(String),
}

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Vendor API rejected the call (or the client could not be built).
    #[error("{provider} API error: {message}")]
    Vendor {
        provider: ProviderType,
        message: String,
    },

    /// Expansion obtained fewer instances than requested. The ids that were
    /// obtained are reported next to this error, never dropped.
    #[error("obtained {obtained} of {requested} instances ({} failed batches)", causes.len())]
    PartialFailure {
        requested: usize,
        obtained: usize,
        causes: Vec<EngineError>,
    },

    /// A batch unit panicked or vanished before reporting.
    #[error("batch unit {unit} faulted: {message}")]
    UnitFault { unit: usize, message: String },

    #[error("store error: {0}")]
    Store(String),
}

impl EngineError {
    pub fn vendor(provider: ProviderType, err: impl std::fmt::Display) -> Self {
        EngineError::Vendor {
            provider,
            message: err.to_string(),
        }
    }

    pub fn store(err: impl std::fmt::Display) -> Self {
        EngineError::Store(err.to_string())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, EngineError::Config(_))
    }

    /// Unit-level causes carried by a partial failure, or the error itself.
    pub fn causes(&self) -> Vec<&EngineError> {
        match self {
            EngineError::PartialFailure { causes, .. } => causes.iter().collect(),
            other => vec![other],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_flagged() {
        let err: EngineError = ConfigError::UnsupportedProvider("OracleCloud".into()).into();
        assert!(err.is_config());
        assert_eq!(err.to_string(), "unsupported provider: OracleCloud");
        assert!(!EngineError::store("boom").is_config());
    }

    #[test]
    fn partial_failure_lists_every_cause() {
        let err = EngineError::PartialFailure {
            requested: 250,
            obtained: 50,
            causes: vec![
                EngineError::vendor(ProviderType::Alibaba, "quota exceeded"),
                EngineError::UnitFault {
                    unit: 2,
                    message: "panic".into(),
                },
            ],
        };
        assert_eq!(err.to_string(), "obtained 50 of 250 instances (2 failed batches)");
        assert_eq!(err.causes().len(), 2);
    }
}
