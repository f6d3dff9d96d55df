//! Error types of the topic modelling engine.

use std::path::PathBuf;

/// Errors returned by configuring calls and data loaders.
///
/// Hot loops of the processor never build these; data errors found while
/// processing a batch are logged and the batch is skipped.
#[derive(Debug, thiserror::Error)]
pub enum ArtmError {
    /// The call is not valid in the current state (shape mismatch, bad config).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A numeric argument is outside of its allowed range.
    #[error("argument out of range: {name} = {value}")]
    ArgumentOutOfRange {
        /// argument name
        name: &'static str,
        /// offending value, rendered
        value: String,
    },

    /// A serialized message could not be decoded.
    #[error("corrupted message: {0}")]
    CorruptedMessage(String),

    /// A file could not be read.
    #[error("unable to read {path}: {source}")]
    DiskRead {
        /// path of the file
        path: PathBuf,
        /// io cause
        source: std::io::Error,
    },

    /// A file could not be written.
    #[error("unable to write {path}: {source}")]
    DiskWrite {
        /// path of the file
        path: PathBuf,
        /// io cause
        source: std::io::Error,
    },

    /// A named object (model, dictionary, batch, regularizer, score) is missing.
    #[error("{kind} '{name}' does not exist")]
    NotFound {
        /// kind of the object
        kind: &'static str,
        /// requested name
        name: String,
    },

    /// The factory has no constructor for the requested type tag.
    #[error("unknown {kind} type '{type_name}'")]
    UnknownType {
        /// regularizer or score
        kind: &'static str,
        /// requested type tag
        type_name: String,
    },

    /// A worker thread is gone or a handshake was dropped.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type of the crate.
pub type Result<T> = std::result::Result<T, ArtmError>;

impl ArtmError {
    /// Create an invalid operation error.
    pub fn invalid<S: Into<String>>(msg: S) -> Self {
        Self::InvalidOperation(msg.into())
    }

    /// Create an argument out of range error.
    pub fn out_of_range<V: std::fmt::Display>(name: &'static str, value: V) -> Self {
        Self::ArgumentOutOfRange { name, value: value.to_string() }
    }

    /// Create a not found error.
    pub fn not_found<S: Into<String>>(kind: &'static str, name: S) -> Self {
        Self::NotFound { kind, name: name.into() }
    }

    /// Create an unknown type error.
    pub fn unknown_type<S: Into<String>>(kind: &'static str, type_name: S) -> Self {
        Self::UnknownType { kind, type_name: type_name.into() }
    }
}

impl From<serde_cbor::Error> for ArtmError {
    fn from(err: serde_cbor::Error) -> Self {
        ArtmError::CorruptedMessage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_object() {
        let err = ArtmError::not_found("model", "pwt");
        assert_eq!(err.to_string(), "model 'pwt' does not exist");

        let err = ArtmError::out_of_range("num_topics", 0);
        assert_eq!(err.to_string(), "argument out of range: num_topics = 0");

        let err = ArtmError::unknown_type("regularizer", "Foo");
        assert_eq!(err.to_string(), "unknown regularizer type 'Foo'");
    }
}
