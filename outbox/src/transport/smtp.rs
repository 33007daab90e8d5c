use async_trait::async_trait;
use outbox_smtp::{ClientError, ClientOptions, Response, SmtpClient};

use super::{Connector, Envelope, MailConnection, RecipientReply, SendFailure, SessionProperties};
use crate::{error::TransportError, internal};

/// Connects to destinations over SMTP using [`outbox_smtp::SmtpClient`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SmtpConnector;

#[async_trait]
impl Connector for SmtpConnector {
    async fn connect(
        &self,
        session: &SessionProperties,
    ) -> Result<Box<dyn MailConnection>, TransportError> {
        let options = ClientOptions {
            implicit_tls: session.ssl,
            connect_timeout: session.connect_timeout,
            command_timeout: session.socket_timeout,
            accept_invalid_certs: session.accept_invalid_certs,
        };

        let mut client = SmtpClient::connect(&session.host, session.port, options).await?;

        let greeting = client.read_greeting().await?;
        if !greeting.is_success() {
            return Err(TransportError::Greeting(describe(&greeting)));
        }

        let mut capabilities = hello(&mut client, &session.helo_name).await?;

        if session.starttls && !client.is_tls() {
            if !capabilities.supports("STARTTLS") {
                return Err(TransportError::Tls(
                    "Server does not advertise STARTTLS".to_string(),
                ));
            }

            let response = client.starttls().await?;
            if !response.is_success() {
                return Err(TransportError::Tls(format!(
                    "STARTTLS refused: {}",
                    describe(&response)
                )));
            }

            // Capabilities may change once the channel is secure (RFC 3207 §4.2)
            capabilities = hello(&mut client, &session.helo_name).await?;
        }

        if let Some(credentials) = &session.credentials {
            client
                .authenticate(
                    &credentials.username,
                    &credentials.password,
                    &capabilities.auth_mechanisms(),
                )
                .await?;
            internal!("Authenticated to {}:{}", session.host, session.port);
        }

        Ok(Box::new(SmtpConnection {
            client,
            allow_partial: session.allow_partial,
        }))
    }
}

/// Sends EHLO, falling back to HELO for servers that do not speak ESMTP.
async fn hello(client: &mut SmtpClient, helo_name: &str) -> Result<Response, TransportError> {
    let ehlo = client.ehlo(helo_name).await?;
    if ehlo.is_success() {
        return Ok(ehlo);
    }

    let helo = client.helo(helo_name).await?;
    if helo.is_success() {
        Ok(helo)
    } else {
        Err(TransportError::Greeting(describe(&helo)))
    }
}

fn describe(response: &Response) -> String {
    format!("{} {}", response.code, response.message())
}

fn reply(address: &str, command: &str, response: &Response) -> RecipientReply {
    RecipientReply {
        address: address.to_string(),
        command: command.to_string(),
        code: response.code,
        text: response.message(),
    }
}

/// Maps a client error to the scope it affects.
fn failure(error: ClientError) -> SendFailure {
    let error = TransportError::from(error);
    if error.is_connection_level() {
        SendFailure::Connection(error)
    } else {
        SendFailure::Message(error)
    }
}

struct SmtpConnection {
    client: SmtpClient,
    allow_partial: bool,
}

impl SmtpConnection {
    async fn reset(&mut self) -> Result<(), SendFailure> {
        self.client.rset().await.map(|_| ()).map_err(failure)
    }

    /// Gives up on the current transaction, reporting recipients individually.
    async fn abandon(
        &mut self,
        unsent: Vec<RecipientReply>,
        invalid: Vec<RecipientReply>,
    ) -> Result<(), SendFailure> {
        self.reset().await?;
        Err(SendFailure::Addresses {
            sent: Vec::new(),
            unsent,
            invalid,
        })
    }
}

#[async_trait]
impl MailConnection for SmtpConnection {
    async fn send(&mut self, envelope: &Envelope, data: &[u8]) -> Result<(), SendFailure> {
        let response = self
            .client
            .mail_from(&envelope.sender)
            .await
            .map_err(failure)?;
        if !response.is_success() {
            self.reset().await?;
            return Err(SendFailure::Message(TransportError::Rejected {
                command: "MAIL FROM".to_string(),
                code: response.code,
                text: response.message(),
            }));
        }

        let mut accepted = Vec::with_capacity(envelope.recipients.len());
        let mut invalid = Vec::new();
        for recipient in &envelope.recipients {
            let response = self.client.rcpt_to(recipient).await.map_err(failure)?;
            let reply = reply(recipient, "RCPT TO", &response);
            if response.is_success() {
                accepted.push(reply);
            } else {
                invalid.push(reply);
            }
        }

        if accepted.is_empty() || (!invalid.is_empty() && !self.allow_partial) {
            return self.abandon(accepted, invalid).await;
        }

        let response = self.client.data().await.map_err(failure)?;
        if !response.is_intermediate() {
            let unsent = accepted
                .iter()
                .map(|r| reply(&r.address, "DATA", &response))
                .collect();
            return self.abandon(unsent, invalid).await;
        }

        let response = self.client.send_data(data).await.map_err(failure)?;
        if !response.is_success() {
            let unsent = accepted
                .iter()
                .map(|r| reply(&r.address, "DATA", &response))
                .collect();
            return Err(SendFailure::Addresses {
                sent: Vec::new(),
                unsent,
                invalid,
            });
        }

        if invalid.is_empty() {
            Ok(())
        } else {
            Err(SendFailure::Addresses {
                sent: accepted,
                unsent: Vec::new(),
                invalid,
            })
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.quit().await {
            tracing::debug!("Error closing SMTP session: {e}");
        }
    }
}
