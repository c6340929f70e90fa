/// Errors surfaced by store operations.
///
/// Worker loops treat these as transient: log at WARN and retry on the next
/// iteration. Only the initial connectivity probe at startup is fatal.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store did not answer within the call deadline.
    #[error("store: operation timed out: {0}")]
    Timeout(String),

    /// The backing store is unreachable or refused the operation.
    #[error("store: unavailable: {0}")]
    Unavailable(String),

    /// A stored blob could not be decoded into its domain type.
    #[error("store: corrupt entry under '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// Convenience `Result` alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
