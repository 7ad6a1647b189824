//! Error types for address and pattern parsing.

use thiserror::Error;

/// Error parsing a `host:port` value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    /// The value has no hostname part.
    #[error("Missing hostname in '{0}'")]
    MissingHostname(String),

    /// The port is not a valid 16-bit number.
    #[error("Invalid port in '{0}'")]
    InvalidPort(String),
}

/// Error compiling a URL pattern.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// The pattern does not follow the URL pattern grammar.
    #[error("Malformed url pattern: '{0}'")]
    Malformed(String),

    /// The pathname could not be compiled into a matcher.
    #[error("Invalid pathname in pattern '{pattern}': {message}")]
    Pathname {
        /// The offending pattern.
        pattern: String,
        /// Compiler message.
        message: String,
    },
}
