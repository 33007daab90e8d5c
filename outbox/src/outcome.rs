//! Per-message and per-recipient delivery outcomes.

use std::{fmt, sync::Arc};

use outbox_smtp::SmtpCode;

use crate::{error::TransportError, transport::RecipientReply};

/// One recipient's delivery result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendDetail {
    pub address: String,
    pub success: bool,
    /// The SMTP command the server was answering, if any.
    pub command: Option<String>,
    /// Raw reply text from the server, if any.
    pub server_text: Option<String>,
    /// Reply code mapped through the code table, [`SmtpCode::Fallback`] when
    /// unmapped or when no reply was involved.
    pub code: SmtpCode,
}

impl SendDetail {
    /// A failure with no server reply attached.
    #[must_use]
    pub fn generic(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            success: false,
            command: None,
            server_text: None,
            code: SmtpCode::Fallback,
        }
    }

    #[must_use]
    pub fn from_reply(reply: RecipientReply, success: bool) -> Self {
        Self {
            address: reply.address,
            success,
            command: Some(reply.command),
            server_text: Some(reply.text),
            code: SmtpCode::from_code(reply.code),
        }
    }
}

/// How much of a batch a transport failure covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureScope {
    /// The connection failed; every remaining message of the batch shares the cause.
    Batch,
    /// Only this message failed; the batch carried on.
    Message,
}

/// The result of attempting to send one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Success,
    /// The server judged recipients individually and not all were delivered.
    PartialFailure(Vec<SendDetail>),
    TransportFailure {
        cause: Arc<TransportError>,
        scope: FailureScope,
        /// A generic detail for every intended recipient.
        details: Vec<SendDetail>,
    },
}

impl SendOutcome {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    #[must_use]
    pub fn details(&self) -> &[SendDetail] {
        match self {
            Self::Success => &[],
            Self::PartialFailure(details) | Self::TransportFailure { details, .. } => details,
        }
    }

    /// Whether at least one recipient received the message.
    #[must_use]
    pub fn any_delivered(&self) -> bool {
        self.is_success() || self.details().iter().any(|detail| detail.success)
    }

    /// Builds the outcome for an address-level failure.
    ///
    /// Succeeds only when nothing is unsent and nothing is invalid.
    #[must_use]
    pub fn from_addresses(
        sent: Vec<RecipientReply>,
        unsent: Vec<RecipientReply>,
        invalid: Vec<RecipientReply>,
    ) -> Self {
        if unsent.is_empty() && invalid.is_empty() {
            return Self::Success;
        }

        let details = sent
            .into_iter()
            .map(|reply| SendDetail::from_reply(reply, true))
            .chain(
                unsent
                    .into_iter()
                    .chain(invalid)
                    .map(|reply| SendDetail::from_reply(reply, false)),
            )
            .collect();

        Self::PartialFailure(details)
    }

    /// Builds a transport failure marking every recipient as failed.
    #[must_use]
    pub fn transport_failure<'a>(
        cause: Arc<TransportError>,
        scope: FailureScope,
        recipients: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self::TransportFailure {
            cause,
            scope,
            details: recipients.into_iter().map(SendDetail::generic).collect(),
        }
    }
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "delivered"),
            Self::PartialFailure(details) => {
                let failed = details.iter().filter(|detail| !detail.success).count();
                write!(f, "{failed} of {} recipient(s) failed", details.len())
            }
            Self::TransportFailure { cause, .. } => write!(f, "{cause}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(address: &str, code: u16) -> RecipientReply {
        RecipientReply {
            address: address.to_string(),
            command: "RCPT TO".to_string(),
            code,
            text: format!("{code} reply"),
        }
    }

    #[test]
    fn addresses_without_failures_are_success() {
        let outcome = SendOutcome::from_addresses(vec![reply("a@example.com", 250)], vec![], vec![]);
        assert!(outcome.is_success());
        assert!(outcome.details().is_empty());
    }

    #[test]
    fn invalid_recipients_produce_partial_failure() {
        let outcome = SendOutcome::from_addresses(
            vec![reply("good@example.com", 250)],
            vec![],
            vec![reply("bad@example.com", 550)],
        );

        let SendOutcome::PartialFailure(details) = &outcome else {
            panic!("expected partial failure, got {outcome:?}");
        };
        assert_eq!(details.len(), 2);
        assert!(details[0].success);
        assert_eq!(details[0].code, SmtpCode::Ok);
        assert!(!details[1].success);
        assert_eq!(details[1].address, "bad@example.com");
        assert_eq!(details[1].code, SmtpCode::MailboxUnavailable);
        assert_eq!(details[1].command.as_deref(), Some("RCPT TO"));
        assert!(outcome.any_delivered());
        assert_eq!(outcome.to_string(), "1 of 2 recipient(s) failed");
    }

    #[test]
    fn unmapped_codes_fall_back() {
        let outcome = SendOutcome::from_addresses(vec![], vec![], vec![reply("x@example.com", 599)]);
        assert_eq!(outcome.details()[0].code, SmtpCode::Fallback);
        assert!(!outcome.any_delivered());
    }

    #[test]
    fn transport_failure_marks_every_recipient() {
        let cause = Arc::new(TransportError::Connection("refused".to_string()));
        let outcome = SendOutcome::transport_failure(
            Arc::clone(&cause),
            FailureScope::Batch,
            ["a@example.com", "b@example.com"],
        );

        assert_eq!(outcome.details().len(), 2);
        assert!(outcome.details().iter().all(|d| !d.success && d.command.is_none()));
        assert!(
            outcome
                .details()
                .iter()
                .all(|d| d.code == SmtpCode::Fallback)
        );
        assert_eq!(outcome.to_string(), "Connection failed: refused");
    }
}
