//! Error types for the intent proxy

use std::io;

use thiserror::Error;

/// Result type alias for the intent proxy
pub type Result<T> = std::result::Result<T, Error>;

/// Intent proxy errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal, startup only)
    #[error("Configuration error: {0}")]
    Config(String),

    /// No certificate in the presented chain carries a Subject Alternative Name
    #[error("No intent present in client certificate")]
    NoIntentPresent,

    /// The Subject Alternative Name extension is not valid DER of the expected shape
    #[error("Malformed intent extension: {0}")]
    MalformedExtension(String),

    /// The first `GeneralName` is not an `otherName`
    #[error("No otherName present in Subject Alternative Name")]
    NoOtherName,

    /// The authorization service answered with a non-200 status
    #[error("Authorization denied (HTTP {status})")]
    AuthorizationDenied {
        /// HTTP status returned by the authorization service
        status: u16,
    },

    /// The authorization service could not be reached or timed out
    #[error("Authorization service error: {0}")]
    AuthorizationService(String),

    /// I/O failure in one relay direction
    #[error("Relay I/O error ({direction}): {source}")]
    RelayIo {
        /// Direction that failed
        direction: &'static str,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// TLS setup or handshake error
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error rejects a handshake (as opposed to a local or fatal failure).
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::NoIntentPresent
                | Self::MalformedExtension(_)
                | Self::NoOtherName
                | Self::AuthorizationDenied { .. }
                | Self::AuthorizationService(_)
        )
    }

    /// Whether this is a certificate parsing failure.
    #[must_use]
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            Self::NoIntentPresent | Self::MalformedExtension(_) | Self::NoOtherName
        )
    }
}
