//! SMTP client with support for implicit TLS, STARTTLS and SASL authentication.

use std::{sync::Arc, time::Duration};

use base64::{Engine, prelude::BASE64_STANDARD};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_rustls::{
    TlsConnector,
    rustls::{ClientConfig, RootCertStore, pki_types::ServerName},
};

use crate::{
    error::{ClientError, Result},
    response::Response,
};

/// Initial size of the read buffer for SMTP responses.
const BUFFER_SIZE: usize = 8192;

/// Maximum size of the read buffer to prevent unbounded growth (1MB).
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Connection-level settings for an [`SmtpClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Negotiate TLS immediately after connecting (SMTPS), rather than via STARTTLS.
    pub implicit_tls: bool,
    /// Upper bound on establishing the TCP (and implicit TLS) connection.
    pub connect_timeout: Duration,
    /// Upper bound on waiting for any single reply.
    pub command_timeout: Duration,
    /// Accept any server certificate. Only meant for testing.
    pub accept_invalid_certs: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            implicit_tls: false,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
            accept_invalid_certs: false,
        }
    }
}

/// An SMTP client connection that can be either plain TCP or TLS-wrapped.
enum ClientConnection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl ClientConnection {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Plain(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
            Self::Tls(stream) => {
                stream.write_all(data).await?;
                stream.flush().await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = match self {
            Self::Plain(stream) => stream.read(buf).await?,
            Self::Tls(stream) => stream.read(buf).await?,
        };
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(n)
    }

    const fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    async fn upgrade_to_tls(self, domain: &str, accept_invalid_certs: bool) -> Result<Self> {
        let Self::Plain(stream) = self else {
            return Err(ClientError::TlsError(
                "Connection is already TLS".to_string(),
            ));
        };

        let mut root_store = RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            root_store
                .add(cert)
                .map_err(|e| ClientError::TlsError(format!("Failed to add certificate: {e}")))?;
        }
        if !certs.errors.is_empty() {
            tracing::warn!(?certs.errors, "Some certificates could not be loaded");
        }

        let mut config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        if accept_invalid_certs {
            config
                .dangerous()
                .set_certificate_verifier(Arc::new(NoVerifier));
        }

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(domain.to_string())
            .map_err(|e| ClientError::TlsError(format!("Invalid domain: {e}")))?;

        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| ClientError::TlsError(e.to_string()))?;

        Ok(Self::Tls(Box::new(tls_stream)))
    }
}

/// A certificate verifier that accepts all certificates (for testing only).
#[derive(Debug)]
struct NoVerifier;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::ServerCertVerified,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> std::result::Result<
        tokio_rustls::rustls::client::danger::HandshakeSignatureValid,
        tokio_rustls::rustls::Error,
    > {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        use tokio_rustls::rustls::SignatureScheme;

        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// An SMTP client for sending commands and receiving replies.
///
/// Every reply is awaited for at most [`ClientOptions::command_timeout`]; an
/// expired wait surfaces as [`ClientError::Timeout`] and leaves the connection
/// unusable.
pub struct SmtpClient {
    connection: Option<ClientConnection>,
    buffer: Vec<u8>,
    buffer_pos: usize,
    server_domain: String,
    options: ClientOptions,
}

impl SmtpClient {
    /// Connects to `host:port`, negotiating TLS first if the options ask for it.
    ///
    /// The server greeting is not read; call [`SmtpClient::read_greeting`] next.
    pub async fn connect(host: &str, port: u16, options: ClientOptions) -> Result<Self> {
        let connect_timeout = options.connect_timeout;

        let connection = tokio::time::timeout(connect_timeout, async {
            let stream = TcpStream::connect((host, port)).await?;
            let connection = ClientConnection::Plain(stream);
            if options.implicit_tls {
                connection
                    .upgrade_to_tls(host, options.accept_invalid_certs)
                    .await
            } else {
                Ok(connection)
            }
        })
        .await
        .map_err(|_| ClientError::Timeout {
            operation: "connect",
            timeout: connect_timeout,
        })??;

        tracing::debug!(host, port, tls = connection.is_tls(), "Connected to SMTP server");

        Ok(Self {
            connection: Some(connection),
            buffer: vec![0u8; BUFFER_SIZE],
            buffer_pos: 0,
            server_domain: host.to_string(),
            options,
        })
    }

    /// Whether the connection is currently protected by TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(ClientConnection::is_tls)
    }

    /// Reads the initial server greeting (220 response).
    pub async fn read_greeting(&mut self) -> Result<Response> {
        self.read_response("greeting").await
    }

    /// Sends a raw command and reads the response.
    pub async fn command(&mut self, command: &str) -> Result<Response> {
        tracing::trace!(target: "outbox_smtp::outgoing", "{command}");
        self.send_raw(format!("{command}\r\n").as_bytes()).await?;
        self.read_response(command_name(command)).await
    }

    /// Sends EHLO with the specified domain.
    pub async fn ehlo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("EHLO {domain}")).await
    }

    /// Sends HELO with the specified domain.
    pub async fn helo(&mut self, domain: &str) -> Result<Response> {
        self.command(&format!("HELO {domain}")).await
    }

    /// Sends STARTTLS and, when the server agrees, upgrades the connection to TLS.
    pub async fn starttls(&mut self) -> Result<Response> {
        let response = self.command("STARTTLS").await?;

        if response.is_success() {
            let old_connection = self
                .connection
                .take()
                .ok_or(ClientError::ConnectionClosed)?;
            let upgrade = old_connection
                .upgrade_to_tls(&self.server_domain, self.options.accept_invalid_certs);
            let connection = tokio::time::timeout(self.options.command_timeout, upgrade)
                .await
                .map_err(|_| ClientError::Timeout {
                    operation: "TLS handshake",
                    timeout: self.options.command_timeout,
                })??;
            self.connection = Some(connection);
            self.buffer_pos = 0;
        }

        Ok(response)
    }

    /// Authenticates with `AUTH PLAIN`, or `AUTH LOGIN` if that is all the server offers.
    ///
    /// `mechanisms` is the list advertised in the EHLO reply. An empty list is
    /// treated as PLAIN being available.
    pub async fn authenticate(
        &mut self,
        username: &str,
        password: &str,
        mechanisms: &[String],
    ) -> Result<Response> {
        let offers = |name: &str| mechanisms.iter().any(|m| m.eq_ignore_ascii_case(name));

        let response = if mechanisms.is_empty() || offers("PLAIN") {
            let token = BASE64_STANDARD.encode(format!("\0{username}\0{password}"));
            tracing::trace!(target: "outbox_smtp::outgoing", "AUTH PLAIN <redacted>");
            self.send_raw(format!("AUTH PLAIN {token}\r\n").as_bytes())
                .await?;
            self.read_response("AUTH").await?
        } else if offers("LOGIN") {
            self.auth_login(username, password).await?
        } else {
            return Err(ClientError::UnsupportedAuth(mechanisms.join(" ")));
        };

        if response.is_success() {
            Ok(response)
        } else {
            Err(ClientError::Rejected {
                command: "AUTH",
                response,
            })
        }
    }

    async fn auth_login(&mut self, username: &str, password: &str) -> Result<Response> {
        let challenge = self.command("AUTH LOGIN").await?;
        if !challenge.is_intermediate() {
            return Ok(challenge);
        }

        tracing::trace!(target: "outbox_smtp::outgoing", "<redacted username>");
        self.send_raw(format!("{}\r\n", BASE64_STANDARD.encode(username)).as_bytes())
            .await?;
        let challenge = self.read_response("AUTH").await?;
        if !challenge.is_intermediate() {
            return Ok(challenge);
        }

        tracing::trace!(target: "outbox_smtp::outgoing", "<redacted password>");
        self.send_raw(format!("{}\r\n", BASE64_STANDARD.encode(password)).as_bytes())
            .await?;
        self.read_response("AUTH").await
    }

    /// Sends MAIL FROM command.
    pub async fn mail_from(&mut self, from: &str) -> Result<Response> {
        self.command(&format!("MAIL FROM:<{from}>")).await
    }

    /// Sends RCPT TO command.
    pub async fn rcpt_to(&mut self, to: &str) -> Result<Response> {
        self.command(&format!("RCPT TO:<{to}>")).await
    }

    /// Sends DATA command.
    pub async fn data(&mut self) -> Result<Response> {
        self.command("DATA").await
    }

    /// Sends the message content, dot-stuffed, followed by the end-of-data marker.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<Response> {
        let mut payload = dot_stuff(data);
        payload.extend_from_slice(b".\r\n");
        tracing::trace!(target: "outbox_smtp::outgoing", bytes = payload.len(), "<message data>");
        self.send_raw(&payload).await?;
        self.read_response("end of data").await
    }

    /// Sends RSET command to reset the transaction.
    pub async fn rset(&mut self) -> Result<Response> {
        self.command("RSET").await
    }

    /// Sends QUIT and drops the connection.
    pub async fn quit(&mut self) -> Result<Response> {
        let response = self.command("QUIT").await;
        self.connection = None;
        response
    }

    async fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.connection
            .as_mut()
            .ok_or(ClientError::ConnectionClosed)?
            .send(data)
            .await
    }

    async fn read_response(&mut self, operation: &'static str) -> Result<Response> {
        let timeout = self.options.command_timeout;
        let response = tokio::time::timeout(timeout, self.read_response_inner())
            .await
            .map_err(|_| ClientError::Timeout { operation, timeout })??;
        tracing::trace!(
            target: "outbox_smtp::incoming",
            "{} {}",
            response.code,
            response.message()
        );
        Ok(response)
    }

    async fn read_response_inner(&mut self) -> Result<Response> {
        loop {
            if let Some((response, consumed)) =
                Response::parse_response(&self.buffer[..self.buffer_pos])?
            {
                self.buffer.copy_within(consumed..self.buffer_pos, 0);
                self.buffer_pos -= consumed;
                return Ok(response);
            }

            if self.buffer_pos >= self.buffer.len() {
                let new_size = self.buffer.len() * 2;
                if new_size > MAX_BUFFER_SIZE {
                    return Err(ClientError::ParseError(format!(
                        "Response too large (exceeds {MAX_BUFFER_SIZE} bytes)"
                    )));
                }
                self.buffer.resize(new_size, 0);
            }

            let connection = self
                .connection
                .as_mut()
                .ok_or(ClientError::ConnectionClosed)?;
            let n = connection.read(&mut self.buffer[self.buffer_pos..]).await?;
            self.buffer_pos += n;
        }
    }
}

/// The verb of a command line, used to label timeouts.
fn command_name(command: &str) -> &'static str {
    let verb = command.split([' ', ':']).next().unwrap_or_default();
    match verb.to_ascii_uppercase().as_str() {
        "EHLO" => "EHLO",
        "HELO" => "HELO",
        "STARTTLS" => "STARTTLS",
        "AUTH" => "AUTH",
        "MAIL" => "MAIL FROM",
        "RCPT" => "RCPT TO",
        "DATA" => "DATA",
        "RSET" => "RSET",
        "QUIT" => "QUIT",
        "NOOP" => "NOOP",
        _ => "command",
    }
}

/// Normalises line endings to CRLF and doubles leading dots (RFC 5321 §4.5.2).
///
/// The result always ends with CRLF.
#[must_use]
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 64 + 2);
    let mut at_line_start = true;

    for (i, &byte) in data.iter().enumerate() {
        if at_line_start && byte == b'.' {
            out.push(b'.');
        }
        match byte {
            b'\n' => {
                if i == 0 || data[i - 1] != b'\r' {
                    out.push(b'\r');
                }
                out.push(b'\n');
                at_line_start = true;
            }
            _ => {
                out.push(byte);
                at_line_start = false;
            }
        }
    }

    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out
}
