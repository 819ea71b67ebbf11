use std::fmt;

/// Which syncable-partition limit a write would have crossed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuotaViolation {
    /// Sum of all key and value bytes exceeds the partition quota.
    TotalBytes { used: usize, limit: usize },
    /// A single entry is larger than the per-item cap.
    ItemBytes { key: String, size: usize, limit: usize },
    /// Too many keys.
    ItemCount { count: usize, limit: usize },
}

impl fmt::Display for QuotaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaViolation::TotalBytes { used, limit } => {
                write!(f, "total size {} bytes exceeds quota of {} bytes", used, limit)
            }
            QuotaViolation::ItemBytes { key, size, limit } => {
                write!(f, "item '{}' is {} bytes, limit is {} bytes", key, size, limit)
            }
            QuotaViolation::ItemCount { count, limit } => {
                write!(f, "{} items exceeds the limit of {}", count, limit)
            }
        }
    }
}

/// Errors raised by partitions, backends and the storage manager.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write would exceed a syncable-partition limit. Recoverable: triggers local fallback.
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(QuotaViolation),

    /// Stored data could not be decoded.
    #[error("Corrupt data under key '{key}': {message}")]
    Corrupt { key: String, message: String },

    #[error("Snippet not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_message_names_the_limit() {
        let err = StoreError::QuotaExceeded(QuotaViolation::ItemBytes {
            key: "snippet:abc".to_string(),
            size: 9000,
            limit: 8192,
        });
        assert!(err.is_quota_exceeded());
        assert!(err.to_string().contains("snippet:abc"));
        assert!(err.to_string().contains("8192"));
    }

    #[test]
    fn test_not_found_is_not_quota() {
        assert!(!StoreError::NotFound("x".to_string()).is_quota_exceeded());
    }
}
