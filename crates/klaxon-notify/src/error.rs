use klaxon_store::error::StoreError;

/// Errors raised by the notification subsystem.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// Sender configuration is missing a required field or holds an invalid
    /// value.
    #[error("notify: invalid sender configuration: {0}")]
    InvalidConfig(String),

    /// No sender is registered for the contact type.
    #[error("notify: unknown sender type '{0}'")]
    UnknownSenderType(String),

    /// SMTP transport failure.
    #[error("notify: SMTP error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    /// Building the mail message failed.
    #[error("notify: email build error: {0}")]
    Email(#[from] lettre::error::Error),

    /// A mail address could not be parsed.
    #[error("notify: bad address: {0}")]
    Address(#[from] lettre::address::AddressError),

    /// An HTTP request to an external endpoint failed.
    #[error("notify: HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The external endpoint answered with a non-success status.
    #[error("notify: endpoint returned {status}: {body}")]
    Endpoint { status: u16, body: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type NotifyResult<T> = std::result::Result<T, NotifyError>;
