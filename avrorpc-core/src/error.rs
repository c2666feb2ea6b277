//! Core error types.

use thiserror::Error;

/// Errors raised while building or negotiating protocols.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("missing protocol name")]
    MissingName,

    #[error("invalid protocol document: {0}")]
    InvalidDocument(String),

    #[error("invalid message \"{0}\": {1}")]
    InvalidMessage(String, String),

    #[error("invalid one-way message \"{0}\"")]
    InvalidOneWay(String),

    #[error("missing response for message \"{0}\"")]
    MissingResponse(String),

    #[error("unknown message: {0}")]
    UnknownMessage(String),

    #[error("one-way mismatch for handler on \"{0}\"")]
    HandlerMismatch(String),

    #[error("incompatible protocols: {0}")]
    Incompatible(String),

    #[error("schema error: {0}")]
    Schema(#[from] apache_avro::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(CoreError::MissingName.to_string(), "missing protocol name");
        assert_eq!(
            CoreError::UnknownMessage("id".to_string()).to_string(),
            "unknown message: id"
        );
        assert!(CoreError::Incompatible("missing server message: beat".to_string())
            .to_string()
            .contains("missing server message: beat"));
    }
}
