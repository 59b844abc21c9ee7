//! Service startup errors
//!
//! Per-request failures are turned into HTTP responses by the handlers and
//! never propagate as Rust errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("credential store unavailable: {0}")]
    CredentialStore(String),

    #[error("session restore failed: {0}")]
    Session(String),

    #[error("metrics recorder: {0}")]
    Metrics(String),

    #[error(transparent)]
    Config(#[from] common::Error),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages_are_descriptive() {
        assert_eq!(
            Error::CredentialStore("reading token file: permission denied".into()).to_string(),
            "credential store unavailable: reading token file: permission denied"
        );
        assert!(
            Error::Session("store locked".into())
                .to_string()
                .contains("store locked")
        );
        assert!(
            Error::Metrics("recorder already installed".into())
                .to_string()
                .starts_with("metrics recorder")
        );
    }
}
