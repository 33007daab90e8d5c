//! Minimal asynchronous SMTP submission client.
//!
//! Speaks just enough of RFC 5321 to hand a message to a relay: greeting,
//! `EHLO`/`HELO`, optional `STARTTLS` or implicit TLS, `AUTH PLAIN`/`AUTH LOGIN`,
//! the `MAIL`/`RCPT`/`DATA` transaction, `RSET` and `QUIT`.

pub mod client;
pub mod error;
pub mod response;
pub mod status;

pub use client::{ClientOptions, SmtpClient, dot_stuff};
pub use error::{ClientError, Result};
pub use response::{Response, ResponseLine};
pub use status::SmtpCode;
