//! SMTP reply code table.
//!
//! Maps the numeric reply codes of RFC 5321 (plus the authentication codes of
//! RFC 4954) onto a closed set of conditions. Any code without an entry maps to
//! [`SmtpCode::Fallback`], whose numeric value is `0`.

use core::fmt::{self, Display, Formatter};

#[repr(u16)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum SmtpCode {
    /// Used whenever a reply code has no entry in the table.
    Fallback = 0,
    SystemStatus = 211,
    HelpMessage = 214,
    ServiceReady = 220,
    ServiceClosing = 221,
    AuthenticationSucceeded = 235,
    Ok = 250,
    UserNotLocalWillForward = 251,
    CannotVerifyUser = 252,
    AuthenticationContinue = 334,
    StartMailInput = 354,
    ServiceNotAvailable = 421,
    MailboxUnavailableTemporary = 450,
    LocalError = 451,
    InsufficientStorage = 452,
    TemporaryAuthenticationFailure = 454,
    ParametersNotAccommodated = 455,
    SyntaxError = 500,
    ParameterSyntaxError = 501,
    CommandNotImplemented = 502,
    BadSequence = 503,
    ParameterNotImplemented = 504,
    AuthenticationRequired = 530,
    AuthenticationFailed = 535,
    MailboxUnavailable = 550,
    UserNotLocal = 551,
    ExceededStorage = 552,
    MailboxNameNotAllowed = 553,
    TransactionFailed = 554,
    ParametersNotRecognized = 555,
}

impl SmtpCode {
    /// Looks up a numeric reply code, falling back to [`SmtpCode::Fallback`].
    #[must_use]
    pub const fn from_code(code: u16) -> Self {
        match code {
            211 => Self::SystemStatus,
            214 => Self::HelpMessage,
            220 => Self::ServiceReady,
            221 => Self::ServiceClosing,
            235 => Self::AuthenticationSucceeded,
            250 => Self::Ok,
            251 => Self::UserNotLocalWillForward,
            252 => Self::CannotVerifyUser,
            334 => Self::AuthenticationContinue,
            354 => Self::StartMailInput,
            421 => Self::ServiceNotAvailable,
            450 => Self::MailboxUnavailableTemporary,
            451 => Self::LocalError,
            452 => Self::InsufficientStorage,
            454 => Self::TemporaryAuthenticationFailure,
            455 => Self::ParametersNotAccommodated,
            500 => Self::SyntaxError,
            501 => Self::ParameterSyntaxError,
            502 => Self::CommandNotImplemented,
            503 => Self::BadSequence,
            504 => Self::ParameterNotImplemented,
            530 => Self::AuthenticationRequired,
            535 => Self::AuthenticationFailed,
            550 => Self::MailboxUnavailable,
            551 => Self::UserNotLocal,
            552 => Self::ExceededStorage,
            553 => Self::MailboxNameNotAllowed,
            554 => Self::TransactionFailed,
            555 => Self::ParametersNotRecognized,
            _ => Self::Fallback,
        }
    }

    /// The numeric reply code, `0` for [`SmtpCode::Fallback`].
    #[must_use]
    pub const fn code(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::Fallback => "unrecognised reply code",
            Self::SystemStatus => "system status",
            Self::HelpMessage => "help message",
            Self::ServiceReady => "service ready",
            Self::ServiceClosing => "service closing transmission channel",
            Self::AuthenticationSucceeded => "authentication succeeded",
            Self::Ok => "requested mail action okay, completed",
            Self::UserNotLocalWillForward => "user not local; will forward",
            Self::CannotVerifyUser => "cannot verify user, but will accept message",
            Self::AuthenticationContinue => "authentication challenge",
            Self::StartMailInput => "start mail input",
            Self::ServiceNotAvailable => "service not available, closing transmission channel",
            Self::MailboxUnavailableTemporary => "mailbox temporarily unavailable",
            Self::LocalError => "local error in processing",
            Self::InsufficientStorage => "insufficient system storage",
            Self::TemporaryAuthenticationFailure => "temporary authentication failure",
            Self::ParametersNotAccommodated => "server unable to accommodate parameters",
            Self::SyntaxError => "syntax error, command unrecognised",
            Self::ParameterSyntaxError => "syntax error in parameters or arguments",
            Self::CommandNotImplemented => "command not implemented",
            Self::BadSequence => "bad sequence of commands",
            Self::ParameterNotImplemented => "command parameter not implemented",
            Self::AuthenticationRequired => "authentication required",
            Self::AuthenticationFailed => "authentication credentials invalid",
            Self::MailboxUnavailable => "mailbox unavailable",
            Self::UserNotLocal => "user not local",
            Self::ExceededStorage => "exceeded storage allocation",
            Self::MailboxNameNotAllowed => "mailbox name not allowed",
            Self::TransactionFailed => "transaction failed",
            Self::ParametersNotRecognized => "mail from/rcpt to parameters not recognised",
        }
    }

    /// Checks if the code is a permanent rejection (5xx)
    #[must_use]
    pub const fn is_permanent(self) -> bool {
        self.code() >= 500
    }

    /// Checks if the code is a temporary rejection (4xx)
    #[must_use]
    pub const fn is_temporary(self) -> bool {
        self.code() >= 400 && self.code() < 500
    }
}

impl From<u16> for SmtpCode {
    fn from(value: u16) -> Self {
        Self::from_code(value)
    }
}

impl From<SmtpCode> for u16 {
    fn from(value: SmtpCode) -> Self {
        value.code()
    }
}

impl Display for SmtpCode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        write!(fmt, "{} {}", self.code(), self.description())
    }
}
