use klaxon_store::error::StoreError;

/// Errors raised while evaluating a trigger.
///
/// Everything except `Store` marks the trigger `EXCEPTION`; store errors are
/// transient and retried on the next scheduled check.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("checker: syntax error in expression: {0}")]
    Syntax(String),

    #[error("checker: unknown function '{0}'")]
    UnknownFunction(String),

    #[error("checker: {name} takes {expected} arguments, got {got}")]
    Arity {
        name: String,
        expected: String,
        got: usize,
    },

    #[error("checker: type error: {0}")]
    Type(String),

    #[error("checker: unknown variable '{0}'")]
    UnknownVariable(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type CheckResult<T> = std::result::Result<T, CheckError>;
