//! Error types for tabflow-core operations.

use serde::{Deserialize, Serialize};

/// A domain of a rule being saved that is already covered by another enabled rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConflict {
    pub domain: String,
    pub rule_id: String,
    pub rule_name: String,
}

/// All errors that can occur in tabflow-core operations.
///
/// Stale timers, vanished tabs and unknown stash ids are deliberately absent:
/// those are no-ops.
#[derive(Debug, thiserror::Error)]
pub enum TabflowError {
    // ─────────────────────────────────────────────────────────────────────
    // Persistence Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Storage read failed: {key}: {details}")]
    StorageRead { key: String, details: String },

    #[error("Storage write failed: {details}")]
    StorageWrite { details: String },

    #[error("Stored value malformed: {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Rule Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Rule conflicts with {} domain(s) of existing rules", conflicts.len())]
    RuleConflict { conflicts: Vec<RuleConflict> },

    #[error("Invalid domain: {0:?}")]
    InvalidDomain(String),

    #[error("Unknown preset: {0}")]
    UnknownPreset(String),

    // ─────────────────────────────────────────────────────────────────────
    // Settings Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),
}

impl TabflowError {
    /// Stable snake_case code used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            TabflowError::StorageRead { .. }
            | TabflowError::StorageWrite { .. }
            | TabflowError::Json { .. } => "storage_error",
            TabflowError::RuleNotFound(_) => "rule_not_found",
            TabflowError::InvalidRule(_) => "invalid_rule",
            TabflowError::RuleConflict { .. } => "rule_conflict",
            TabflowError::InvalidDomain(_) => "invalid_domain",
            TabflowError::UnknownPreset(_) => "unknown_preset",
            TabflowError::InvalidSettings(_) => "invalid_settings",
        }
    }
}

/// Convenience type alias for Results using TabflowError.
pub type Result<T> = std::result::Result<T, TabflowError>;

impl From<TabflowError> for String {
    fn from(err: TabflowError) -> String {
        err.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_message_counts_domains() {
        let err = TabflowError::RuleConflict {
            conflicts: vec![
                RuleConflict {
                    domain: "x.com".to_string(),
                    rule_id: "r1".to_string(),
                    rule_name: "x.com · 30min".to_string(),
                },
                RuleConflict {
                    domain: "reddit.com".to_string(),
                    rule_id: "r1".to_string(),
                    rule_name: "x.com · 30min".to_string(),
                },
            ],
        };
        assert_eq!(
            err.to_string(),
            "Rule conflicts with 2 domain(s) of existing rules"
        );
        assert_eq!(err.code(), "rule_conflict");
    }
}
