//! Error types for the SMTP client.

use std::{io, time::Duration};

use thiserror::Error;

use crate::response::Response;

/// Errors that can occur when using the SMTP client.
#[derive(Error, Debug)]
pub enum ClientError {
    /// IO error occurred during network operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Failed to parse an SMTP response from the server.
    #[error("Failed to parse SMTP response: {0}")]
    ParseError(String),

    /// The server answered a command with a reply the session cannot continue from.
    #[error("Server rejected {command}: {} {}", .response.code, .response.message())]
    Rejected {
        command: &'static str,
        response: Response,
    },

    /// TLS/SSL error occurred.
    #[error("TLS error: {0}")]
    TlsError(String),

    /// The server does not offer an authentication mechanism the client supports.
    #[error("No supported authentication mechanism (server offers: {0})")]
    UnsupportedAuth(String),

    /// Connecting or waiting for a reply took longer than allowed.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// Connection was closed unexpectedly.
    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    /// UTF-8 decoding error.
    #[error("UTF-8 error: {0}")]
    Utf8Error(#[from] std::str::Utf8Error),
}

impl ClientError {
    /// Returns `true` if the connection can no longer be used after this error.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::ConnectionClosed
                | Self::Timeout { .. }
                | Self::TlsError(_)
                | Self::ParseError(_)
                | Self::Utf8Error(_)
        )
    }
}

/// Specialized `Result` type for SMTP client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
