//! Scripted SMTP server for exercising the delivery path end to end.
//!
//! The server can:
//! - Answer each command with a configurable reply
//! - Reject chosen recipients individually
//! - Delay the reply to the end of message data, keeping a batch in flight
//! - Drop the connection after a number of commands
//! - Record every command and message body it receives
#![allow(dead_code)] // Not every test uses every knob

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::timeout,
};

/// A command received by the mock server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    Auth(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Message content between `DATA` and the terminating dot, dot-stuffing intact.
    MessageContent(String),
    Rset,
    Quit,
    StartTls,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    message: String,
}

impl Reply {
    fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn to_bytes(&self) -> Vec<u8> {
        format!("{} {}\r\n", self.code, self.message).into_bytes()
    }
}

#[derive(Clone)]
struct Script {
    greeting: Reply,
    capabilities: Vec<String>,
    mail_from: Reply,
    rcpt_to: Reply,
    rcpt_overrides: AHashMap<String, Reply>,
    data: Reply,
    data_end: Reply,
    auth: Reply,
    data_end_delay: Option<Duration>,
    drop_after_commands: Option<usize>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "Mock SMTP Server"),
            capabilities: vec!["mock.example.com".to_string(), "SIZE 10000000".to_string()],
            mail_from: Reply::new(250, "OK"),
            rcpt_to: Reply::new(250, "OK"),
            rcpt_overrides: AHashMap::new(),
            data: Reply::new(354, "Start mail input; end with <CRLF>.<CRLF>"),
            data_end: Reply::new(250, "OK: Message accepted"),
            auth: Reply::new(235, "Authentication successful"),
            data_end_delay: None,
            drop_after_commands: None,
        }
    }
}

impl Script {
    fn ehlo_bytes(&self) -> Vec<u8> {
        let mut response = String::new();
        let last = self.capabilities.len().saturating_sub(1);
        for (i, capability) in self.capabilities.iter().enumerate() {
            let separator = if i < last { '-' } else { ' ' };
            let _ = write!(&mut response, "250{separator}{capability}\r\n");
        }
        response.into_bytes()
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<SmtpCommand>>>,
    connections: Arc<AtomicUsize>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    #[must_use]
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
        }
    }

    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    #[must_use]
    pub fn commands(&self) -> Vec<SmtpCommand> {
        self.commands.lock().clone()
    }

    /// Bodies of every message received, in order.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .filter_map(|command| match command {
                SmtpCommand::MessageContent(content) => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of connections accepted so far.
    #[must_use]
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    #[allow(clippy::too_many_lines)]
    async fn handle_client(
        mut stream: TcpStream,
        script: Arc<Script>,
        commands: Arc<Mutex<Vec<SmtpCommand>>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut handled = 0;

        writer.write_all(&script.greeting.to_bytes()).await?;
        writer.flush().await?;

        loop {
            if script.drop_after_commands.is_some_and(|limit| handled >= limit) {
                return Ok(());
            }

            line.clear();
            let Ok(read) = timeout(Duration::from_secs(10), reader.read_line(&mut line)).await
            else {
                return Ok(());
            };
            if read? == 0 {
                return Ok(());
            }
            handled += 1;

            let command_line = line.trim_end();
            let (verb, argument) = command_line
                .split_once(' ')
                .unwrap_or((command_line, ""));

            let (command, response) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => (SmtpCommand::Ehlo(argument.to_string()), script.ehlo_bytes()),
                "HELO" => (
                    SmtpCommand::Helo(argument.to_string()),
                    Reply::new(250, "Hello").to_bytes(),
                ),
                "AUTH" => (
                    SmtpCommand::Auth(argument.to_string()),
                    script.auth.to_bytes(),
                ),
                "MAIL" => (
                    SmtpCommand::MailFrom(argument.to_string()),
                    script.mail_from.to_bytes(),
                ),
                "RCPT" => {
                    let address = argument
                        .trim_start_matches("TO:")
                        .trim_start_matches('<')
                        .trim_end_matches('>')
                        .to_string();
                    let reply = script
                        .rcpt_overrides
                        .get(&address)
                        .unwrap_or(&script.rcpt_to);
                    (SmtpCommand::RcptTo(address), reply.to_bytes())
                }
                "DATA" => (SmtpCommand::Data, script.data.to_bytes()),
                "RSET" => (SmtpCommand::Rset, Reply::new(250, "OK").to_bytes()),
                "STARTTLS" => (
                    SmtpCommand::StartTls,
                    Reply::new(502, "Command not implemented").to_bytes(),
                ),
                "QUIT" => {
                    commands.lock().push(SmtpCommand::Quit);
                    writer.write_all(&Reply::new(221, "Bye").to_bytes()).await?;
                    writer.flush().await?;
                    return Ok(());
                }
                _ => (
                    SmtpCommand::Other(command_line.to_string()),
                    Reply::new(500, "Unknown command").to_bytes(),
                ),
            };

            let is_data = command == SmtpCommand::Data;
            commands.lock().push(command);
            writer.write_all(&response).await?;
            writer.flush().await?;

            if !(is_data && script.data.code == 354) {
                continue;
            }

            let mut content = String::new();
            let mut data_line = String::new();
            loop {
                data_line.clear();
                if reader.read_line(&mut data_line).await? == 0 {
                    return Ok(());
                }
                if data_line.trim_end() == "." {
                    break;
                }
                content.push_str(&data_line);
            }

            if let Some(delay) = script.data_end_delay {
                tokio::time::sleep(delay).await;
            }
            commands.lock().push(SmtpCommand::MessageContent(content));
            writer.write_all(&script.data_end.to_bytes()).await?;
            writer.flush().await?;
        }
    }
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.greeting = Reply::new(code, message);
        self
    }

    /// Replaces the EHLO reply lines; the first is the server's greeting line.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.script.capabilities = capabilities.iter().map(ToString::to_string).collect();
        self
    }

    #[must_use]
    pub fn with_mail_from_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.mail_from = Reply::new(code, message);
        self
    }

    /// The reply for every recipient without a specific override.
    #[must_use]
    pub fn with_rcpt_to_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.rcpt_to = Reply::new(code, message);
        self
    }

    /// The reply for one specific recipient.
    #[must_use]
    pub fn with_rcpt_response_for(
        mut self,
        address: impl Into<String>,
        code: u16,
        message: impl Into<String>,
    ) -> Self {
        self.script
            .rcpt_overrides
            .insert(address.into(), Reply::new(code, message));
        self
    }

    #[must_use]
    pub fn with_data_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data = Reply::new(code, message);
        self
    }

    /// The reply after the message content (after `<CRLF>.<CRLF>`).
    #[must_use]
    pub fn with_data_end_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.data_end = Reply::new(code, message);
        self
    }

    #[must_use]
    pub fn with_auth_response(mut self, code: u16, message: impl Into<String>) -> Self {
        self.script.auth = Reply::new(code, message);
        self
    }

    /// Waits this long before acknowledging each message's content.
    #[must_use]
    pub const fn with_data_end_delay(mut self, delay: Duration) -> Self {
        self.script.data_end_delay = Some(delay);
        self
    }

    /// Closes the connection after `count` commands.
    #[must_use]
    pub const fn with_network_error_after_commands(mut self, count: usize) -> Self {
        self.script.drop_after_commands = Some(count);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let commands = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let shutdown = Arc::new(AtomicBool::new(false));

        let server = MockSmtpServer {
            addr,
            commands: Arc::clone(&commands),
            connections: Arc::clone(&connections),
            shutdown: Arc::clone(&shutdown),
        };

        tokio::spawn(async move {
            while !shutdown.load(Ordering::Relaxed) {
                // Accept with a timeout so the shutdown flag is noticed
                let Ok(Ok((stream, _peer))) =
                    timeout(Duration::from_millis(100), listener.accept()).await
                else {
                    continue;
                };

                connections.fetch_add(1, Ordering::Relaxed);
                let script = Arc::clone(&script);
                let commands = Arc::clone(&commands);
                tokio::spawn(async move {
                    if let Err(e) = MockSmtpServer::handle_client(stream, script, commands).await {
                        tracing::debug!("Mock server client error: {e}");
                    }
                });
            }
        });

        Ok(server)
    }
}
