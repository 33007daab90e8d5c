//! Outbound mail queueing.
//!
//! A [`Dispatcher`] accepts messages for any number of destinations. Each
//! distinct [`DestinationConfig`] gets a bounded [`DestinationQueue`] whose
//! worker task delivers messages in batches, one connection per batch.
//! Messages that cannot be delivered, for whatever reason, are written to a
//! [`FailedMailSink`]; everything else was delivered.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod listener;
pub mod logging;
pub mod message;
pub mod outcome;
pub mod queue;
pub mod sink;
pub mod transport;

pub use outbox_smtp::SmtpCode;
pub use tracing;

pub use self::{
    config::{DestinationConfig, DispatcherSettings},
    dispatcher::{Dispatcher, DispatcherBuilder},
    error::{ConfigError, LifecycleError, MessageError, PolicyError, TransportError, ValidationError},
    listener::{
        ConnectionEvent, ConnectionListener, DeliveryEvent, DeliveryListener, DeliveryStatus,
        Listeners,
    },
    message::{Attachment, Message},
    outcome::{FailureScope, SendDetail, SendOutcome},
    queue::{DestinationQueue, QueueState},
    sink::{FailedMail, FailedMailSink, FailureKind, FailureReason, MemorySink, TracingSink},
    transport::{Connector, MailConnection, SmtpConnector, TransportClient},
};
