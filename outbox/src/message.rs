//! The message value handed to the dispatcher, and its wire rendering.

use std::fmt::Write;

use base64::{Engine, prelude::BASE64_STANDARD};
use chrono::{DateTime, Utc};
use mailparse::addrparse;
use ulid::Ulid;

use crate::{error::MessageError, transport::Envelope};

/// Line length for base64-encoded attachment bodies (RFC 2045).
const BASE64_LINE_LENGTH: usize = 76;

/// A file attached to a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    /// MIME content type, e.g. `application/pdf`.
    pub content_type: String,
    pub data: Vec<u8>,
}

/// An outbound email.
///
/// Addresses may be bare (`user@example.com`) or carry a display name
/// (`User <user@example.com>`); headers keep them as given, the SMTP envelope
/// uses the bare address.
///
/// # Examples
///
/// ```
/// use outbox::Message;
///
/// let message = Message::new()
///     .from("Reports <reports@example.com>")
///     .to("ops@example.com")
///     .bcc("audit@example.com")
///     .subject("Nightly report")
///     .body("All green.");
///
/// assert_eq!(message.recipients().count(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub from: Option<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    /// Envelope-only recipients; never rendered into the headers.
    pub bcc: Vec<String>,
    pub reply_to: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
    pub attachments: Vec<Attachment>,
    /// Preserved when set, otherwise assigned just before sending.
    pub message_id: Option<String>,
    /// Set by the dispatcher on enqueue if absent.
    pub sent_at: Option<DateTime<Utc>>,
}

impl Message {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from(mut self, address: impl Into<String>) -> Self {
        self.from = Some(address.into());
        self
    }

    #[must_use]
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    #[must_use]
    pub fn cc(mut self, address: impl Into<String>) -> Self {
        self.cc.push(address.into());
        self
    }

    #[must_use]
    pub fn bcc(mut self, address: impl Into<String>) -> Self {
        self.bcc.push(address.into());
        self
    }

    #[must_use]
    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Adds a custom header. Order of insertion is kept.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn attach(
        mut self,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        self.attachments.push(Attachment {
            filename: filename.into(),
            content_type: content_type.into(),
            data,
        });
        self
    }

    #[must_use]
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    #[must_use]
    pub const fn sent_at(mut self, at: DateTime<Utc>) -> Self {
        self.sent_at = Some(at);
        self
    }

    /// Every non-blank recipient across To, Cc and Bcc, in that order.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(String::as_str)
            .filter(|address| !address.trim().is_empty())
    }

    #[must_use]
    pub fn has_sender(&self) -> bool {
        self.from
            .as_deref()
            .is_some_and(|from| !from.trim().is_empty())
    }

    #[must_use]
    pub fn has_recipients(&self) -> bool {
        self.recipients().next().is_some()
    }

    /// Fills in the `Date` and `Message-ID` values the wire form needs.
    pub fn prepare(&mut self, helo_name: &str) {
        if self.sent_at.is_none() {
            self.sent_at = Some(Utc::now());
        }
        if self.message_id.is_none() {
            self.message_id = Some(format!("<{}@{helo_name}>", Ulid::new()));
        }
    }

    /// The SMTP envelope: bare sender and recipient addresses.
    pub fn envelope(&self) -> Result<Envelope, MessageError> {
        let sender = self
            .from
            .as_deref()
            .ok_or_else(|| MessageError::InvalidAddress {
                address: String::new(),
                reason: "no sender".to_string(),
            })
            .and_then(envelope_address)?;

        let recipients = self
            .recipients()
            .map(envelope_address)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Envelope { sender, recipients })
    }

    /// Renders the message as RFC 5322 text with CRLF line endings.
    ///
    /// Messages without attachments are a single `text/plain` part; otherwise a
    /// `multipart/mixed` body with base64-encoded attachments is produced.
    pub fn render(&self, charset: &str) -> Result<Vec<u8>, MessageError> {
        let mut message = String::with_capacity(1024);
        self.write_headers(&mut message)?;

        if self.attachments.is_empty() {
            write!(
                &mut message,
                "Content-Type: text/plain; charset={charset}\r\n\r\n"
            )?;
            if let Some(body) = &self.body {
                message.push_str(body);
            }
        } else {
            let boundary = format!("----=_Part_{}", Ulid::new());
            write!(
                &mut message,
                "Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n"
            )?;

            write!(&mut message, "--{boundary}\r\n")?;
            write!(
                &mut message,
                "Content-Type: text/plain; charset={charset}\r\n\r\n"
            )?;
            if let Some(body) = &self.body {
                message.push_str(body);
            }
            message.push_str("\r\n");

            for attachment in &self.attachments {
                write!(&mut message, "--{boundary}\r\n")?;
                write_header(&mut message, "Content-Type", &attachment.content_type)?;
                message.push_str("Content-Transfer-Encoding: base64\r\n");
                write_header(
                    &mut message,
                    "Content-Disposition",
                    &format!("attachment; filename=\"{}\"", attachment.filename),
                )?;
                message.push_str("\r\n");
                push_base64(&mut message, &attachment.data);
            }

            write!(&mut message, "--{boundary}--\r\n")?;
        }

        Ok(message.into_bytes())
    }

    fn write_headers(&self, message: &mut String) -> Result<(), MessageError> {
        let date = self.sent_at.unwrap_or_else(Utc::now);
        write_header(message, "Date", &date.to_rfc2822())?;

        if let Some(id) = &self.message_id {
            write_header(message, "Message-ID", id)?;
        }
        if let Some(from) = &self.from {
            write_header(message, "From", from)?;
        }
        if let Some(reply_to) = &self.reply_to {
            write_header(message, "Reply-To", reply_to)?;
        }
        if !self.to.is_empty() {
            write_header(message, "To", &self.to.join(", "))?;
        }
        if !self.cc.is_empty() {
            write_header(message, "Cc", &self.cc.join(", "))?;
        }
        if let Some(subject) = &self.subject {
            write_header(message, "Subject", subject)?;
        }
        for (name, value) in &self.headers {
            if name.is_empty() || name.contains(':') {
                return Err(MessageError::Render(format!("Invalid header name '{name}'")));
            }
            write_header(message, name, value)?;
        }

        message.push_str("MIME-Version: 1.0\r\n");
        Ok(())
    }
}

/// Writes `name: value`, refusing line breaks that would start a new header.
fn write_header(message: &mut String, name: &str, value: &str) -> Result<(), MessageError> {
    if name.contains(['\r', '\n']) || value.contains(['\r', '\n']) {
        return Err(MessageError::Render(format!(
            "Line break in '{}' header",
            name.escape_debug()
        )));
    }
    write!(message, "{name}: {value}\r\n")?;
    Ok(())
}

/// Extracts the bare address from `user@host` or `Name <user@host>`.
pub(crate) fn envelope_address(address: &str) -> Result<String, MessageError> {
    let invalid = |reason: String| MessageError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    let list = addrparse(address).map_err(|e| invalid(e.to_string()))?;
    let info = list
        .extract_single_info()
        .ok_or_else(|| invalid("expected a single mailbox".to_string()))?;

    if info.addr.contains('@') {
        Ok(info.addr)
    } else {
        Err(invalid("missing domain".to_string()))
    }
}

fn push_base64(message: &mut String, data: &[u8]) {
    let encoded = BASE64_STANDARD.encode(data);
    let mut rest = encoded.as_str();
    while !rest.is_empty() {
        let (line, tail) = rest.split_at(rest.len().min(BASE64_LINE_LENGTH));
        message.push_str(line);
        message.push_str("\r\n");
        rest = tail;
    }
}
