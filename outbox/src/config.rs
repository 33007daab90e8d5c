//! Destination and dispatcher configuration.

use std::{fmt, path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const fn default_port() -> u16 {
    25
}

const fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

const fn default_socket_timeout() -> u64 {
    60_000 // 1 minute
}

fn default_charset() -> String {
    "utf-8".to_string()
}

/// Everything needed to reach and authenticate against one SMTP server.
///
/// Two configurations are the same destination iff every field is equal; each
/// distinct value gets its own queue and worker.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Authentication is attempted iff this is set.
    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Negotiate TLS immediately on connect (SMTPS).
    #[serde(default)]
    pub ssl: bool,

    /// Upgrade the connection with STARTTLS before authenticating.
    #[serde(default)]
    pub starttls: bool,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Upper bound on waiting for any single server reply.
    #[serde(default = "default_socket_timeout")]
    pub socket_timeout_ms: u64,

    #[serde(default = "default_charset")]
    pub charset: String,
}

impl DestinationConfig {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            ssl: false,
            starttls: false,
            connect_timeout_ms: default_connect_timeout(),
            socket_timeout_ms: default_socket_timeout(),
            charset: default_charset(),
        }
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    #[must_use]
    pub const fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    #[must_use]
    pub const fn with_starttls(mut self, starttls: bool) -> Self {
        self.starttls = starttls;
        self
    }

    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Timeouts beyond u64::MAX milliseconds are not meaningful"
    )]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        reason = "Timeouts beyond u64::MAX milliseconds are not meaningful"
    )]
    pub const fn with_socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout_ms = timeout.as_millis() as u64;
        self
    }

    #[must_use]
    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = charset.into();
        self
    }

    /// Whether a username is configured.
    #[must_use]
    pub const fn auth_enabled(&self) -> bool {
        self.username.is_some()
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }
}

impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssl", &self.ssl)
            .field("starttls", &self.starttls)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("socket_timeout_ms", &self.socket_timeout_ms)
            .field("charset", &self.charset)
            .finish()
    }
}

impl fmt::Display for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

const fn default_queue_capacity() -> usize {
    1000
}

const fn default_batch_size() -> usize {
    50
}

const fn default_stop_poll_interval() -> u64 {
    100
}

fn default_helo_name() -> String {
    "localhost".to_string()
}

/// Tunables shared by every destination queue a [`Dispatcher`](crate::Dispatcher) creates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Messages buffered per destination before `queue_message` waits for space.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Maximum number of messages sent over one connection.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How often `stop` checks whether the workers have exited (in milliseconds)
    #[serde(default = "default_stop_poll_interval")]
    pub stop_poll_interval_ms: u64,

    /// Sandbox mode: only recipients matching `debug_allowed_suffixes` are accepted,
    /// and subjects are marked.
    ///
    /// Default: `false`
    #[serde(default)]
    pub debug: bool,

    /// Address suffixes (e.g. `@example.test`) recipients must end with in debug mode.
    #[serde(default)]
    pub debug_allowed_suffixes: Vec<String>,

    /// Name announced in EHLO and used as the right-hand side of generated Message-IDs.
    #[serde(default = "default_helo_name")]
    pub helo_name: String,

    /// Accept invalid TLS certificates (for testing only)
    ///
    /// Default: `false`
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            stop_poll_interval_ms: default_stop_poll_interval(),
            debug: false,
            debug_allowed_suffixes: Vec::new(),
            helo_name: default_helo_name(),
            accept_invalid_certs: false,
        }
    }
}

impl DispatcherSettings {
    /// Parses settings from a RON document.
    pub fn from_ron_str(input: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(input)?)
    }

    /// Reads and parses a RON settings file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_ron_str(&contents)
    }

    #[must_use]
    pub const fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    /// Whether `address` may receive mail while debug mode is on.
    #[must_use]
    pub fn is_debug_allowed(&self, address: &str) -> bool {
        let address = address.trim().to_ascii_lowercase();
        self.debug_allowed_suffixes
            .iter()
            .any(|suffix| address.ends_with(&suffix.to_ascii_lowercase()))
    }
}
