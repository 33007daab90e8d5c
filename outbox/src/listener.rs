//! Optional observers of connections and deliveries.
//!
//! Listeners run synchronously on the destination worker. A listener returning
//! an error, or panicking, is logged and otherwise ignored; it never affects the
//! batch.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crate::{config::DestinationConfig, message::Message, outcome::SendDetail};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened,
    /// The session was ended normally after a batch.
    Closed,
    /// The connection could not be opened or broke mid-batch.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    /// Some recipients received the message, others did not.
    PartiallyDelivered,
    NotDelivered,
}

/// One message's delivery result, as seen by [`DeliveryListener`]s.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryEvent<'a> {
    pub status: DeliveryStatus,
    pub destination: &'a DestinationConfig,
    pub message: &'a Message,
    /// Per-recipient details; empty for a clean delivery.
    pub details: &'a [SendDetail],
}

pub trait ConnectionListener: Send + Sync {
    fn on_connection(
        &self,
        event: ConnectionEvent,
        destination: &DestinationConfig,
    ) -> anyhow::Result<()>;
}

pub trait DeliveryListener: Send + Sync {
    fn on_delivery(&self, event: &DeliveryEvent<'_>) -> anyhow::Result<()>;
}

/// The configured listeners, shared by every destination.
#[derive(Clone, Default)]
pub struct Listeners {
    connection: Vec<Arc<dyn ConnectionListener>>,
    delivery: Vec<Arc<dyn DeliveryListener>>,
}

impl Listeners {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_connection_listener(mut self, listener: Arc<dyn ConnectionListener>) -> Self {
        self.connection.push(listener);
        self
    }

    #[must_use]
    pub fn with_delivery_listener(mut self, listener: Arc<dyn DeliveryListener>) -> Self {
        self.delivery.push(listener);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connection.is_empty() && self.delivery.is_empty()
    }

    pub(crate) fn connection(&self, event: ConnectionEvent, destination: &DestinationConfig) {
        for listener in &self.connection {
            match panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_connection(event, destination)
            })) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(%destination, ?event, "Connection listener failed: {e:#}");
                }
                Err(panic) => tracing::warn!(
                    %destination,
                    ?event,
                    "Connection listener panicked: {}",
                    panic_message(&*panic)
                ),
            }
        }
    }

    pub(crate) fn delivery(&self, event: &DeliveryEvent<'_>) {
        for listener in &self.delivery {
            match panic::catch_unwind(AssertUnwindSafe(|| listener.on_delivery(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(
                    destination = %event.destination,
                    status = ?event.status,
                    "Delivery listener failed: {e:#}"
                ),
                Err(panic) => tracing::warn!(
                    destination = %event.destination,
                    status = ?event.status,
                    "Delivery listener panicked: {}",
                    panic_message(&*panic)
                ),
            }
        }
    }
}

/// The payload of a caught panic, if it is a string.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("<non-string panic payload>")
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners")
            .field("connection", &self.connection.len())
            .field("delivery", &self.delivery.len())
            .finish()
    }
}
