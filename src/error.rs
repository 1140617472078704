use thiserror::Error;

/// Errors that can occur anywhere in the melody sensor core.
#[derive(Error, Debug)]
pub enum MelodyError {
    /// Configuration error (fatal at startup).
    #[error("configuration error: {0}")]
    Config(String),

    /// Rule load-time error: unreadable directory, YAML syntax, schema
    /// violation, unknown selector, uncompilable regex, duplicate name.
    /// Fatal to startup per spec.
    #[error("rule load error: {0}")]
    RuleLoad(String),

    /// I/O error encountered while reading rules or config.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// (De)serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Evaluation-time error (soft; logged and treated as non-match).
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// Session registry error.
    #[error("session registry error: {0}")]
    Session(String),

    /// Invalid internal state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Generic error with context.
    #[error("{0}")]
    Other(String),
}

/// Result type alias using `MelodyError`.
pub type Result<T> = std::result::Result<T, MelodyError>;

impl From<String> for MelodyError {
    fn from(s: String) -> Self {
        MelodyError::Other(s)
    }
}

impl From<&str> for MelodyError {
    fn from(s: &str) -> Self {
        MelodyError::Other(s.to_string())
    }
}

impl From<serde_json::Error> for MelodyError {
    fn from(err: serde_json::Error) -> Self {
        MelodyError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for MelodyError {
    fn from(err: serde_yaml::Error) -> Self {
        MelodyError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for MelodyError {
    fn from(err: config::ConfigError) -> Self {
        MelodyError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MelodyError::Config("missing rules_dir".to_string());
        assert_eq!(err.to_string(), "configuration error: missing rules_dir");
    }

    #[test]
    fn test_error_from_string() {
        let err: MelodyError = "boom".into();
        assert!(matches!(err, MelodyError::Other(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "rules dir missing");
        let err: MelodyError = io_err.into();
        assert!(matches!(err, MelodyError::Io(_)));
    }
}
