//! Configuration error types shared by the proxy binary and its libraries

use thiserror::Error;

/// Common error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_names_the_field() {
        let err = Error::Config("expiry_status_code must be in 400..=599, got 200".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: expiry_status_code must be in 400..=599, got 200"
        );
    }

    #[test]
    fn toml_error_converts_with_question_mark() {
        fn parse(input: &str) -> Result<toml::Table> {
            Ok(toml::from_str(input)?)
        }
        let err = parse("auth = {{{").unwrap_err();
        assert!(matches!(err, Error::Toml(_)), "got: {err:?}");
        assert!(err.to_string().starts_with("TOML parse error:"));
    }
}
