use std::sync::Arc;

use super::{Connector, Envelope, SendFailure, SessionProperties};
use crate::{
    config::{DestinationConfig, DispatcherSettings},
    error::{MessageError, TransportError},
    internal,
    listener::{ConnectionEvent, DeliveryEvent, DeliveryStatus, Listeners},
    message::Message,
    outcome::{FailureScope, SendOutcome},
};

/// What happened to a batch. Messages not listed in `failures` were delivered.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub delivered: usize,
    pub failures: Vec<(Message, SendOutcome)>,
}

/// Delivers batches of messages to a single destination.
pub struct TransportClient {
    destination: Arc<DestinationConfig>,
    session: SessionProperties,
    connector: Arc<dyn Connector>,
    listeners: Listeners,
}

impl TransportClient {
    #[must_use]
    pub fn new(
        destination: Arc<DestinationConfig>,
        settings: &DispatcherSettings,
        connector: Arc<dyn Connector>,
        listeners: Listeners,
    ) -> Self {
        let session = SessionProperties::new(&destination, settings);
        Self {
            destination,
            session,
            connector,
            listeners,
        }
    }

    #[must_use]
    pub const fn session(&self) -> &SessionProperties {
        &self.session
    }

    /// Sends `batch` over a single connection, in order.
    ///
    /// If the connection cannot be opened, or breaks part way through, the
    /// message being sent and every message after it are reported with one
    /// shared [`FailureScope::Batch`] cause. Other failures affect only the
    /// message they occurred on.
    pub async fn send(&self, batch: Vec<Message>) -> BatchReport {
        let mut report = BatchReport::default();
        let destination = self.destination.as_ref();

        let mut connection = match self.connector.connect(&self.session).await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(
                    %destination,
                    batch_size = batch.len(),
                    "Unable to open connection: {e}"
                );
                self.listeners
                    .connection(ConnectionEvent::Disconnected, destination);
                self.abort(&mut report, batch, e);
                return report;
            }
        };

        self.listeners.connection(ConnectionEvent::Opened, destination);
        internal!(
            "Opened connection to {} for {} message(s)",
            destination,
            batch.len()
        );

        let mut pending = batch.into_iter();
        while let Some(mut message) = pending.next() {
            message.prepare(&self.session.helo_name);

            let result = match self.payload(&message) {
                Ok((envelope, data)) => connection.send(&envelope, &data).await,
                Err(e) => Err(SendFailure::Message(e.into())),
            };

            let outcome = match result {
                Ok(()) => SendOutcome::Success,
                Err(SendFailure::Addresses {
                    sent,
                    unsent,
                    invalid,
                }) => SendOutcome::from_addresses(sent, unsent, invalid),
                Err(SendFailure::Message(e)) => {
                    tracing::warn!(
                        %destination,
                        message_id = message.message_id.as_deref(),
                        "Message failed: {e}"
                    );
                    SendOutcome::transport_failure(
                        Arc::new(e),
                        FailureScope::Message,
                        message.recipients(),
                    )
                }
                Err(SendFailure::Connection(e)) => {
                    tracing::warn!(%destination, "Connection lost mid-batch: {e}");
                    self.listeners
                        .connection(ConnectionEvent::Disconnected, destination);
                    self.abort(
                        &mut report,
                        std::iter::once(message).chain(pending),
                        e,
                    );
                    return report;
                }
            };

            self.record(&mut report, message, outcome);
        }

        connection.close().await;
        self.listeners.connection(ConnectionEvent::Closed, destination);

        report
    }

    fn payload(&self, message: &Message) -> Result<(Envelope, Vec<u8>), MessageError> {
        Ok((message.envelope()?, message.render(&self.session.charset)?))
    }

    fn record(&self, report: &mut BatchReport, message: Message, outcome: SendOutcome) {
        let status = if outcome.is_success() {
            DeliveryStatus::Delivered
        } else if outcome.any_delivered() {
            DeliveryStatus::PartiallyDelivered
        } else {
            DeliveryStatus::NotDelivered
        };

        self.listeners.delivery(&DeliveryEvent {
            status,
            destination: &self.destination,
            message: &message,
            details: outcome.details(),
        });

        if outcome.is_success() {
            report.delivered += 1;
        } else {
            report.failures.push((message, outcome));
        }
    }

    /// Fails every message in `messages` with one shared connection-level cause.
    fn abort(
        &self,
        report: &mut BatchReport,
        messages: impl IntoIterator<Item = Message>,
        cause: TransportError,
    ) {
        let cause = Arc::new(cause);
        for message in messages {
            let outcome = SendOutcome::transport_failure(
                Arc::clone(&cause),
                FailureScope::Batch,
                message.recipients(),
            );
            self.record(report, message, outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        listener::{ConnectionListener, DeliveryListener},
        outcome::SendDetail,
        transport::{MailConnection, RecipientReply},
    };

    /// Replays a fixed script of send results.
    struct Scripted {
        connect_error: Option<TransportError>,
        results: Mutex<VecDeque<Result<(), SendFailure>>>,
        sent: Arc<Mutex<Vec<Envelope>>>,
    }

    impl Scripted {
        fn new(results: Vec<Result<(), SendFailure>>) -> Self {
            Self {
                connect_error: None,
                results: Mutex::new(results.into()),
                sent: Arc::default(),
            }
        }

        fn refusing(error: TransportError) -> Self {
            Self {
                connect_error: Some(error),
                ..Self::new(vec![])
            }
        }
    }

    struct ScriptedConnection {
        results: Vec<Result<(), SendFailure>>,
        sent: Arc<Mutex<Vec<Envelope>>>,
    }

    #[async_trait]
    impl Connector for Scripted {
        async fn connect(
            &self,
            _session: &SessionProperties,
        ) -> Result<Box<dyn MailConnection>, TransportError> {
            if let Some(error) = &self.connect_error {
                return Err(error.clone());
            }
            Ok(Box::new(ScriptedConnection {
                results: self.results.lock().drain(..).rev().collect(),
                sent: Arc::clone(&self.sent),
            }))
        }
    }

    #[async_trait]
    impl MailConnection for ScriptedConnection {
        async fn send(&mut self, envelope: &Envelope, _data: &[u8]) -> Result<(), SendFailure> {
            self.sent.lock().push(envelope.clone());
            self.results.pop().unwrap_or(Ok(()))
        }

        async fn close(&mut self) {}
    }

    #[derive(Default)]
    struct Events {
        connection: Mutex<Vec<ConnectionEvent>>,
        delivery: Mutex<Vec<DeliveryStatus>>,
    }

    impl ConnectionListener for Events {
        fn on_connection(
            &self,
            event: ConnectionEvent,
            _destination: &DestinationConfig,
        ) -> anyhow::Result<()> {
            self.connection.lock().push(event);
            Ok(())
        }
    }

    impl DeliveryListener for Events {
        fn on_delivery(&self, event: &DeliveryEvent<'_>) -> anyhow::Result<()> {
            self.delivery.lock().push(event.status);
            anyhow::bail!("listeners may fail without affecting delivery")
        }
    }

    fn client(connector: Scripted, events: &Arc<Events>) -> TransportClient {
        let listeners = Listeners::new()
            .with_connection_listener(Arc::clone(events) as Arc<dyn ConnectionListener>)
            .with_delivery_listener(Arc::clone(events) as Arc<dyn DeliveryListener>);
        TransportClient::new(
            Arc::new(DestinationConfig::new("localhost", 25)),
            &DispatcherSettings::default(),
            Arc::new(connector),
            listeners,
        )
    }

    fn message(n: usize) -> Message {
        Message::new()
            .from("sender@example.com")
            .to(format!("rcpt{n}@example.com"))
            .subject(format!("Message {n}"))
    }

    fn reply(address: &str, code: u16) -> RecipientReply {
        RecipientReply {
            address: address.to_string(),
            command: "RCPT TO".to_string(),
            code,
            text: "reply".to_string(),
        }
    }

    #[tokio::test]
    async fn successful_batch_reports_no_failures() {
        let events = Arc::new(Events::default());
        let client = client(Scripted::new(vec![]), &events);

        let report = client.send((0..3).map(message).collect()).await;

        assert_eq!(report.delivered, 3);
        assert!(report.failures.is_empty());
        assert_eq!(
            *events.connection.lock(),
            vec![ConnectionEvent::Opened, ConnectionEvent::Closed]
        );
        assert_eq!(
            *events.delivery.lock(),
            vec![DeliveryStatus::Delivered; 3]
        );
    }

    #[tokio::test]
    async fn connect_failure_shares_one_cause() {
        let events = Arc::new(Events::default());
        let client = client(
            Scripted::refusing(TransportError::Connection("refused".to_string())),
            &events,
        );

        let report = client.send((0..3).map(message).collect()).await;

        assert_eq!(report.delivered, 0);
        assert_eq!(report.failures.len(), 3);

        let causes: Vec<_> = report
            .failures
            .iter()
            .map(|(_, outcome)| match outcome {
                SendOutcome::TransportFailure {
                    cause,
                    scope: FailureScope::Batch,
                    ..
                } => Arc::clone(cause),
                other => panic!("unexpected outcome {other:?}"),
            })
            .collect();
        assert!(causes.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(
            *events.connection.lock(),
            vec![ConnectionEvent::Disconnected]
        );
        assert_eq!(
            *events.delivery.lock(),
            vec![DeliveryStatus::NotDelivered; 3]
        );
    }

    #[tokio::test]
    async fn message_failure_does_not_stop_the_batch() {
        let events = Arc::new(Events::default());
        let client = client(
            Scripted::new(vec![
                Ok(()),
                Err(SendFailure::Message(TransportError::Rejected {
                    command: "MAIL FROM".to_string(),
                    code: 553,
                    text: "nope".to_string(),
                })),
                Ok(()),
            ]),
            &events,
        );

        let report = client.send((0..3).map(message).collect()).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(report.failures.len(), 1);
        let (failed, outcome) = &report.failures[0];
        assert_eq!(failed.subject.as_deref(), Some("Message 1"));
        assert!(matches!(
            outcome,
            SendOutcome::TransportFailure {
                scope: FailureScope::Message,
                ..
            }
        ));
        assert_eq!(outcome.details(), &[SendDetail::generic("rcpt1@example.com")]);
    }

    #[tokio::test]
    async fn recipient_rejections_become_partial_failures() {
        let events = Arc::new(Events::default());
        let client = client(
            Scripted::new(vec![Err(SendFailure::Addresses {
                sent: vec![reply("good@example.com", 250)],
                unsent: vec![],
                invalid: vec![reply("bad@example.com", 550)],
            })]),
            &events,
        );

        let report = client.send(vec![message(0)]).await;

        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            report.failures[0].1,
            SendOutcome::PartialFailure(_)
        ));
        assert_eq!(
            *events.delivery.lock(),
            vec![DeliveryStatus::PartiallyDelivered]
        );
    }

    #[tokio::test]
    async fn connection_loss_fails_the_rest_of_the_batch() {
        let events = Arc::new(Events::default());
        let connector = Scripted::new(vec![
            Ok(()),
            Err(SendFailure::Connection(TransportError::Connection(
                "reset by peer".to_string(),
            ))),
        ]);
        let sent = Arc::clone(&connector.sent);
        let client = client(connector, &events);

        let report = client.send((0..4).map(message).collect()).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 3);
        assert!(
            report
                .failures
                .iter()
                .all(|(_, outcome)| matches!(
                    outcome,
                    SendOutcome::TransportFailure {
                        scope: FailureScope::Batch,
                        ..
                    }
                ))
        );
        // Nothing is attempted after the connection broke
        assert_eq!(sent.lock().len(), 2);
        assert_eq!(
            *events.connection.lock(),
            vec![ConnectionEvent::Opened, ConnectionEvent::Disconnected]
        );
    }

    #[tokio::test]
    async fn unparseable_address_is_a_message_failure() {
        let events = Arc::new(Events::default());
        let client = client(Scripted::new(vec![]), &events);

        let bad = Message::new().from("sender@example.com").to("nobody");
        let report = client.send(vec![bad, message(1)]).await;

        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures.len(), 1);
        assert!(matches!(
            &report.failures[0].1,
            SendOutcome::TransportFailure { cause, scope: FailureScope::Message, .. }
                if matches!(cause.as_ref(), TransportError::Message(MessageError::InvalidAddress { .. }))
        ));
    }

    #[tokio::test]
    async fn messages_are_prepared_before_sending() {
        let events = Arc::new(Events::default());
        let client = client(
            Scripted::new(vec![Err(SendFailure::Message(TransportError::Rejected {
                command: "DATA".to_string(),
                code: 554,
                text: "no".to_string(),
            }))]),
            &events,
        );

        let report = client.send(vec![message(0)]).await;
        let (failed, _) = &report.failures[0];
        assert!(failed.sent_at.is_some());
        assert!(
            failed
                .message_id
                .as_deref()
                .is_some_and(|id| id.ends_with("@localhost>"))
        );
    }
}
