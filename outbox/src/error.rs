//! Typed errors for each stage a message passes through.
//!
//! None of these are returned to callers of [`Dispatcher`](crate::Dispatcher);
//! they end up inside the [`FailedMail`](crate::FailedMail) records written to
//! the failed-mail sink.

use outbox_smtp::ClientError;
use thiserror::Error;

/// A message was structurally unfit for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Message has no sender")]
    MissingSender,

    #[error("Message has no recipients")]
    MissingRecipients,
}

/// A message was refused by local policy before reaching a queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    /// Debug mode is on and the recipient is outside the allow-list.
    #[error("Recipient {address} is not allowed while debug mode is active")]
    RecipientNotAllowed { address: String },
}

/// The dispatcher or queue was no longer accepting work.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("Dispatcher has been stopped")]
    DispatcherStopped,

    #[error("Destination queue is no longer accepting messages")]
    QueueStopped,

    /// The message was still buffered when an immediate stop was requested.
    #[error("Message was discarded from the queue by an immediate stop")]
    DrainedOnStop,

    /// The destination worker died; its in-flight batch may have been partly sent.
    #[error("Destination worker failed before the message could be delivered")]
    WorkerFailed,
}

/// Building the wire form of a message failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("Failed to render message: {0}")]
    Render(String),
}

impl From<std::fmt::Error> for MessageError {
    fn from(error: std::fmt::Error) -> Self {
        Self::Render(error.to_string())
    }
}

/// A failure talking to the destination server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The TCP connection could not be established or was lost.
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("TLS negotiation failed: {0}")]
    Tls(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The server refused the session in its greeting or EHLO/HELO reply.
    #[error("Server refused session: {0}")]
    Greeting(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// The server's replies could not be understood.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Message(#[from] MessageError),

    /// A command of the mail transaction was rejected.
    #[error("{command} rejected: {code} {text}")]
    Rejected {
        command: String,
        code: u16,
        text: String,
    },
}

impl TransportError {
    /// Returns `true` if the connection cannot carry any further messages.
    #[must_use]
    pub const fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::Tls(_)
                | Self::Authentication(_)
                | Self::Greeting(_)
                | Self::Timeout(_)
                | Self::Protocol(_)
        )
    }
}

/// Classifies SMTP client failures.
///
/// Rejected `AUTH` exchanges become [`TransportError::Authentication`], other
/// rejections keep their command and reply; everything that leaves the socket
/// unusable maps to a connection-level variant.
impl From<ClientError> for TransportError {
    fn from(error: ClientError) -> Self {
        match error {
            ClientError::Rejected {
                command: "AUTH",
                response,
            } => Self::Authentication(format!("{} {}", response.code, response.message())),

            ClientError::Rejected { command, response } => Self::Rejected {
                command: command.to_string(),
                code: response.code,
                text: response.message(),
            },

            ClientError::UnsupportedAuth(mechanisms) => Self::Authentication(format!(
                "No supported mechanism (server offers: {mechanisms})"
            )),

            ClientError::Io(e) => Self::Connection(format!("I/O error: {e}")),

            ClientError::ConnectionClosed => {
                Self::Connection("Connection closed unexpectedly".to_string())
            }

            ClientError::Timeout { .. } => Self::Timeout(error.to_string()),

            ClientError::TlsError(msg) => Self::Tls(msg),

            ClientError::ParseError(msg) => Self::Protocol(msg),

            ClientError::Utf8Error(e) => Self::Protocol(format!("UTF-8 decoding error: {e}")),
        }
    }
}

/// Loading [`DispatcherSettings`](crate::DispatcherSettings) failed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings: {0}")]
    Parse(#[from] ron::error::SpannedError),
}
