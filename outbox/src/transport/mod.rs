//! Delivery of message batches to a destination server.
//!
//! [`TransportClient`] drives a batch over one connection and classifies every
//! message's outcome. The connection itself comes from a [`Connector`]; the
//! default is [`SmtpConnector`].

mod client;
mod smtp;

use std::{fmt, time::Duration};

use async_trait::async_trait;

pub use self::{
    client::{BatchReport, TransportClient},
    smtp::SmtpConnector,
};
use crate::{
    config::{DestinationConfig, DispatcherSettings},
    error::TransportError,
};

/// Bare SMTP envelope addresses for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub sender: String,
    pub recipients: Vec<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Session parameters derived once per destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProperties {
    pub host: String,
    pub port: u16,
    /// Present iff the destination has a username.
    pub credentials: Option<Credentials>,
    pub ssl: bool,
    pub starttls: bool,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    pub charset: String,
    pub helo_name: String,
    pub accept_invalid_certs: bool,
    /// Whether a message may be sent to its accepted recipients when others
    /// were rejected. Always `false` for sessions built by [`SessionProperties::new`].
    pub allow_partial: bool,
}

impl SessionProperties {
    #[must_use]
    pub fn new(config: &DestinationConfig, settings: &DispatcherSettings) -> Self {
        let credentials = config.username.as_ref().map(|username| Credentials {
            username: username.clone(),
            password: config.password.clone().unwrap_or_default(),
        });

        Self {
            host: config.host.clone(),
            port: config.port,
            credentials,
            ssl: config.ssl,
            starttls: config.starttls,
            connect_timeout: config.connect_timeout(),
            socket_timeout: config.socket_timeout(),
            charset: config.charset.clone(),
            helo_name: settings.helo_name.clone(),
            accept_invalid_certs: settings.accept_invalid_certs,
            allow_partial: false,
        }
    }
}

/// The server's reply concerning one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientReply {
    pub address: String,
    /// The command the reply answered, e.g. `RCPT TO` or `DATA`.
    pub command: String,
    pub code: u16,
    pub text: String,
}

/// Why a single message could not be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendFailure {
    /// The server judged some or all recipients individually.
    Addresses {
        /// Accepted and sent.
        sent: Vec<RecipientReply>,
        /// Accepted, but the message was not sent to them.
        unsent: Vec<RecipientReply>,
        /// Rejected by the server.
        invalid: Vec<RecipientReply>,
    },
    /// The message failed as a whole; the connection is still usable.
    Message(TransportError),
    /// The connection broke; nothing more can be sent over it.
    Connection(TransportError),
}

/// Opens connections to a destination.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connects, greets and (if configured) secures and authenticates a session.
    async fn connect(
        &self,
        session: &SessionProperties,
    ) -> Result<Box<dyn MailConnection>, TransportError>;
}

/// An established session that can carry any number of messages.
#[async_trait]
pub trait MailConnection: Send {
    async fn send(&mut self, envelope: &Envelope, data: &[u8]) -> Result<(), SendFailure>;

    /// Ends the session politely. Failures are not reported.
    async fn close(&mut self);
}
