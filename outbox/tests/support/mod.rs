#![allow(dead_code)]

pub mod mock_server;

use std::time::Duration;

use outbox::{DestinationConfig, Message};

pub use self::mock_server::{MockSmtpServer, SmtpCommand};

/// A destination pointing at a local mock server, with short timeouts.
pub fn destination(server: &MockSmtpServer) -> DestinationConfig {
    DestinationConfig::new("127.0.0.1", server.port())
        .with_connect_timeout(Duration::from_secs(2))
        .with_socket_timeout(Duration::from_secs(5))
}

pub fn message(n: usize) -> Message {
    Message::new()
        .from("sender@example.com")
        .to(format!("rcpt{n}@example.com"))
        .subject(format!("Message {n}"))
        .body(format!("Body of message {n}"))
}

/// Polls `condition` every few milliseconds for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}
