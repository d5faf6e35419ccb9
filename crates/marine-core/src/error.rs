//! Error types shared by every layer of the instrument engine.
//!
//! Each variant carries enough context to report the failure upward without
//! losing the literal device text that caused it. Retry loops consult
//! [`Error::is_transient`] to decide whether another attempt is worthwhile.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    // Dialogue errors
    /// The expected prompt never appeared before the deadline.
    #[error("Timeout after {timeout_ms}ms waiting for response to '{command}'")]
    Timeout {
        command: String,
        timeout_ms: u64,
        response: String,
    },

    /// The response matched no known grammar, or rejections exhausted the retries.
    #[error("Protocol error: {message}")]
    Protocol { message: String, response: String },

    /// The device answered with its own rejection text.
    #[error("Command '{command}' rejected by instrument: {response}")]
    Rejected { command: String, response: String },

    // Parameter errors
    #[error("Parameter error: {0}")]
    Parameter(String),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    // Sample errors
    /// A chunk matched a decoder pattern but could not be decoded.
    #[error("Failed to decode {particle_type}: {message}")]
    Sample {
        particle_type: String,
        message: String,
    },

    // Connection errors
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // State machine errors
    #[error("No handler for event {event} in state {state}")]
    UnhandledEvent { state: String, event: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new timeout error.
    pub fn timeout(command: impl Into<String>, timeout_ms: u64, response: impl Into<String>) -> Self {
        Self::Timeout {
            command: command.into(),
            timeout_ms,
            response: response.into(),
        }
    }

    /// Create a new protocol error.
    pub fn protocol(message: impl Into<String>, response: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            response: response.into(),
        }
    }

    /// Create a new rejection error.
    pub fn rejected(command: impl Into<String>, response: impl Into<String>) -> Self {
        Self::Rejected {
            command: command.into(),
            response: response.into(),
        }
    }

    /// Create a new parameter error.
    pub fn parameter(message: impl Into<String>) -> Self {
        Self::Parameter(message.into())
    }

    /// Create a new sample decode error.
    pub fn sample(particle_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sample {
            particle_type: particle_type.into(),
            message: message.into(),
        }
    }

    /// Create a new unhandled event error.
    pub fn unhandled(state: impl std::fmt::Display, event: impl std::fmt::Display) -> Self {
        Self::UnhandledEvent {
            state: state.to_string(),
            event: event.to_string(),
        }
    }

    /// Create a new configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether retrying the same operation could succeed.
    ///
    /// Timeouts and device rejections are transient. Everything else
    /// (type mismatches, read-only writes, lost connections, bad vocabularies)
    /// fails the same way on every attempt.
    ///
    /// # Examples
    ///
    /// ```
    /// use marine_core::Error;
    ///
    /// assert!(Error::timeout("ds", 1000, "").is_transient());
    /// assert!(!Error::parameter("read-only").is_transient());
    /// ```
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Rejected { .. })
    }

    /// Raw device text attached to the error, if any.
    #[must_use]
    pub fn response(&self) -> Option<&str> {
        match self {
            Self::Timeout { response, .. }
            | Self::Protocol { response, .. }
            | Self::Rejected { response, .. } => Some(response),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(Error::timeout("id", 45_000, "partial"), true)]
    #[case(Error::rejected("show bogus", "unknown command"), true)]
    #[case(Error::protocol("retries exhausted", "Usage"), false)]
    #[case(Error::parameter("initat is read-only"), false)]
    #[case(Error::UnknownParameter("nope".into()), false)]
    #[case(Error::sample("spkir", "short payload"), false)]
    #[case(Error::ConnectionLost("closed".into()), false)]
    #[case(Error::unhandled("Autosample", "Set"), false)]
    #[case(Error::config("missing Enter"), false)]
    fn test_transient_classification(#[case] err: Error, #[case] transient: bool) {
        assert_eq!(err.is_transient(), transient);
    }

    #[test]
    fn test_response_text_is_preserved() {
        let err = Error::timeout("ds", 10, "S>partial");
        assert_eq!(err.response(), Some("S>partial"));
        assert!(err.to_string().contains("'ds'"));
        assert_eq!(Error::parameter("x").response(), None);
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
