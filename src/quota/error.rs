/*!
 * Error types for the quota service and its collaborators
 */

use super::model::QuotaType;
use thiserror::Error;

/// Failures of the quota persistence layer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("quota not found for user {user_id} ({quota_type})")]
    NotFound {
        user_id: String,
        quota_type: QuotaType,
    },

    #[error("quota already exists for user {user_id} ({quota_type})")]
    AlreadyExists {
        user_id: String,
        quota_type: QuotaType,
    },

    #[error("version conflict for user {user_id}: expected {expected}, found {found}")]
    VersionConflict {
        user_id: String,
        expected: u64,
        found: u64,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Failures of the quota cache
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache serialization error: {0}")]
    Serialization(String),

    #[error("cache backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    #[error("quota exhausted for user {user_id}")]
    Exhausted { user_id: String },

    #[error("quota suspended for user {user_id}")]
    Suspended { user_id: String },

    #[error("insufficient quota for user {user_id}: requested {requested}, remaining {remaining}")]
    Insufficient {
        user_id: String,
        requested: u64,
        remaining: u64,
    },

    #[error("quota not found for user {user_id} ({quota_type})")]
    NotFound {
        user_id: String,
        quota_type: QuotaType,
    },

    #[error("invalid quota amount: {0}")]
    InvalidAmount(String),

    #[error("quota store error: {0}")]
    Store(StoreError),
}

impl QuotaError {
    /// Budget-based refusals the caller can act on (top up, wait for reset)
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            QuotaError::Exhausted { .. }
                | QuotaError::Suspended { .. }
                | QuotaError::Insufficient { .. }
        )
    }
}

impl From<StoreError> for QuotaError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound {
                user_id,
                quota_type,
            } => QuotaError::NotFound {
                user_id,
                quota_type,
            },
            other => QuotaError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_rejections() {
        assert!(QuotaError::Exhausted {
            user_id: "u".into()
        }
        .is_admission_rejection());
        assert!(QuotaError::Insufficient {
            user_id: "u".into(),
            requested: 50,
            remaining: 40
        }
        .is_admission_rejection());
        assert!(!QuotaError::Store(StoreError::Backend("down".into())).is_admission_rejection());
    }

    #[test]
    fn test_store_not_found_maps_to_quota_not_found() {
        let err: QuotaError = StoreError::NotFound {
            user_id: "u".into(),
            quota_type: QuotaType::Daily,
        }
        .into();
        assert!(matches!(err, QuotaError::NotFound { .. }));
    }
}
