//! Failed-mail sinks: where undeliverable messages are recorded.

use std::{fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::{
    config::DestinationConfig,
    error::{LifecycleError, PolicyError, ValidationError},
    message::Message,
    outcome::{FailureScope, SendOutcome},
};

/// Why a message ended up in the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Validation(ValidationError),
    Policy(PolicyError),
    Lifecycle(LifecycleError),
    /// The destination was contacted (or tried to be) and delivery did not succeed.
    Delivery(SendOutcome),
}

/// Coarse classification of a [`FailureReason`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Validation,
    Policy,
    Lifecycle,
    PartialDelivery,
    Connection,
    Generic,
}

impl FailureReason {
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) => FailureKind::Validation,
            Self::Policy(_) => FailureKind::Policy,
            Self::Lifecycle(_) => FailureKind::Lifecycle,
            Self::Delivery(SendOutcome::PartialFailure(_)) => FailureKind::PartialDelivery,
            Self::Delivery(SendOutcome::TransportFailure {
                scope: FailureScope::Batch,
                ..
            }) => FailureKind::Connection,
            Self::Delivery(_) => FailureKind::Generic,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(e) => write!(f, "{e}"),
            Self::Policy(e) => write!(f, "{e}"),
            Self::Lifecycle(e) => write!(f, "{e}"),
            Self::Delivery(outcome) => write!(f, "{outcome}"),
        }
    }
}

/// A message that will not be delivered, and why.
#[derive(Debug, Clone)]
pub struct FailedMail {
    pub destination: Arc<DestinationConfig>,
    pub message: Message,
    pub reason: FailureReason,
    pub failed_at: DateTime<Utc>,
}

impl FailedMail {
    #[must_use]
    pub fn new(destination: Arc<DestinationConfig>, message: Message, reason: FailureReason) -> Self {
        Self {
            destination,
            message,
            reason,
            failed_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        self.reason.kind()
    }
}

/// Receives every message the dispatcher gives up on.
///
/// Called concurrently from the dispatcher and from every destination worker,
/// so implementations must do their own synchronisation.
pub trait FailedMailSink: Send + Sync {
    fn add(&self, failure: FailedMail);
}

/// Logs each failure at ERROR. The default sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl FailedMailSink for TracingSink {
    fn add(&self, failure: FailedMail) {
        tracing::error!(
            destination = %failure.destination,
            message_id = failure.message.message_id.as_deref().unwrap_or("<none>"),
            kind = ?failure.kind(),
            "Undeliverable message: {}",
            failure.reason
        );
    }
}

/// Keeps failures in memory.
///
/// Primarily intended for testing, but also usable by tools that inspect or
/// replay failures in-process.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<FailedMail>>,
    added: Notify,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of every recorded failure, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<FailedMail> {
        self.records.lock().clone()
    }

    /// Removes and returns every recorded failure.
    pub fn take(&self) -> Vec<FailedMail> {
        std::mem::take(&mut *self.records.lock())
    }

    /// Waits until at least `count` failures have been recorded.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let added = self.added.notified();
                tokio::pin!(added);
                added.as_mut().enable();

                if self.len() >= count {
                    return;
                }
                added.await;
            }
        })
        .await
        .is_ok()
    }
}

impl FailedMailSink for MemorySink {
    fn add(&self, failure: FailedMail) {
        self.records.lock().push(failure);
        self.added.notify_waiters();
    }
}
