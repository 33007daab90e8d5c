//! The process-facing entry point: validation, routing and shutdown.

use std::sync::Arc;

use ahash::AHashMap;
use chrono::Utc;
use parking_lot::RwLock;

use crate::{
    config::{DestinationConfig, DispatcherSettings},
    error::{LifecycleError, PolicyError, ValidationError},
    internal,
    listener::Listeners,
    message::{Message, envelope_address},
    queue::{DestinationQueue, QueueState},
    sink::{FailedMail, FailedMailSink, FailureReason, TracingSink},
    transport::{Connector, SmtpConnector, TransportClient},
};

/// Subject given to messages that have none.
pub const NO_SUBJECT: &str = "(no subject)";

/// Prefixed to every subject while debug mode is on.
pub const DEBUG_SUBJECT_PREFIX: &str = "[DEBUG] ";

struct Registry {
    queues: AHashMap<Arc<DestinationConfig>, Arc<DestinationQueue>>,
    sink: Arc<dyn FailedMailSink>,
    stopped: bool,
}

/// Routes messages to one [`DestinationQueue`] per distinct [`DestinationConfig`].
///
/// Queues and their worker tasks are created on first use and live until
/// [`Dispatcher::stop`]. Callers only learn whether a message was accepted;
/// anything that is not delivered is written to the failed-mail sink.
///
/// # Examples
///
/// ```no_run
/// use outbox::{DestinationConfig, Dispatcher, Message};
///
/// # async fn example() {
/// let dispatcher = Dispatcher::builder().start();
/// let relay = DestinationConfig::new("smtp.example.com", 587).with_starttls(true);
///
/// let accepted = dispatcher
///     .queue_message(
///         &relay,
///         Message::new()
///             .from("noreply@example.com")
///             .to("user@example.com")
///             .subject("Welcome")
///             .body("Hello!"),
///     )
///     .await;
/// assert!(accepted);
///
/// dispatcher.stop(false).await;
/// # }
/// ```
pub struct Dispatcher {
    settings: DispatcherSettings,
    connector: Arc<dyn Connector>,
    listeners: Listeners,
    registry: RwLock<Registry>,
}

/// Configures and starts a [`Dispatcher`].
pub struct DispatcherBuilder {
    settings: DispatcherSettings,
    sink: Arc<dyn FailedMailSink>,
    connector: Arc<dyn Connector>,
    listeners: Listeners,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            settings: DispatcherSettings::default(),
            sink: Arc::new(TracingSink),
            connector: Arc::new(SmtpConnector),
            listeners: Listeners::default(),
        }
    }
}

impl DispatcherBuilder {
    #[must_use]
    pub fn settings(mut self, settings: DispatcherSettings) -> Self {
        self.settings = settings;
        self
    }

    /// The failed-mail sink. Defaults to [`TracingSink`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn FailedMailSink>) -> Self {
        self.sink = sink;
        self
    }

    /// How connections are opened. Defaults to [`SmtpConnector`].
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    #[must_use]
    pub fn listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    #[must_use]
    pub fn start(self) -> Dispatcher {
        internal!(
            level = DEBUG,
            "Dispatcher started (capacity {}, batch size {}, debug {})",
            self.settings.queue_capacity,
            self.settings.batch_size,
            self.settings.debug
        );

        Dispatcher {
            settings: self.settings,
            connector: self.connector,
            listeners: self.listeners,
            registry: RwLock::new(Registry {
                queues: AHashMap::new(),
                sink: self.sink,
                stopped: false,
            }),
        }
    }
}

impl Dispatcher {
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    #[must_use]
    pub const fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    /// Accepts `message` for delivery to `config`.
    ///
    /// Returns `false` if the message was rejected; the reason is written to the
    /// failed-mail sink. Waits while the destination's queue is full.
    pub async fn queue_message(&self, config: &DestinationConfig, mut message: Message) -> bool {
        if let Err(e) = validate(&message) {
            self.reject(config, message, FailureReason::Validation(e));
            return false;
        }

        if self.settings.debug
            && let Err(e) = self.check_debug_policy(&message)
        {
            self.reject(config, message, FailureReason::Policy(e));
            return false;
        }

        self.apply_defaults(&mut message);

        let queue = match self.queue_for(config) {
            Ok(queue) => queue,
            Err(e) => {
                self.reject(config, message, FailureReason::Lifecycle(e));
                return false;
            }
        };

        match queue.enqueue(message).await {
            Ok(()) => true,
            Err((message, e)) => {
                queue.fail(message, FailureReason::Lifecycle(e));
                false
            }
        }
    }

    /// Queues each message in turn, returning how many were accepted.
    pub async fn queue_messages(
        &self,
        config: &DestinationConfig,
        messages: impl IntoIterator<Item = Message>,
    ) -> usize {
        let mut accepted = 0;
        for message in messages {
            if self.queue_message(config, message).await {
                accepted += 1;
            }
        }
        accepted
    }

    /// The sink failures are currently written to.
    #[must_use]
    pub fn failed_mail_sink(&self) -> Arc<dyn FailedMailSink> {
        Arc::clone(&self.registry.read().sink)
    }

    /// Replaces the sink for all future failures, including those of existing
    /// queues. Failures already recorded stay where they are.
    pub fn set_failed_mail_sink(&self, sink: Arc<dyn FailedMailSink>) {
        let mut registry = self.registry.write();
        for queue in registry.queues.values() {
            queue.set_sink(Arc::clone(&sink));
        }
        registry.sink = sink;
    }

    /// Messages buffered across every destination.
    #[must_use]
    pub fn total_queue_length(&self) -> usize {
        self.registry.read().queues.values().map(|q| q.len()).sum()
    }

    /// Messages buffered for one destination; `0` if it has no queue.
    #[must_use]
    pub fn queue_length(&self, config: &DestinationConfig) -> usize {
        self.registry
            .read()
            .queues
            .get(config)
            .map_or(0, |queue| queue.len())
    }

    /// Number of live destination queues.
    #[must_use]
    pub fn queue_count(&self) -> usize {
        self.registry.read().queues.len()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.registry.read().stopped
    }

    /// Stops the dispatcher and waits for every worker to exit.
    ///
    /// New messages are rejected from the moment this is called. With
    /// `immediate`, messages still buffered are written to the sink as lifecycle
    /// failures; batches already being sent always run to completion. Calling
    /// `stop` on a stopped dispatcher does nothing.
    ///
    /// The stop itself takes effect before the first `.await`; dropping the
    /// returned future only abandons the wait.
    pub async fn stop(&self, immediate: bool) {
        let queues: Vec<_> = {
            let mut registry = self.registry.write();
            if registry.stopped {
                return;
            }
            registry.stopped = true;

            for queue in registry.queues.values() {
                queue.stop_accepting(immediate);
            }
            registry.queues.values().cloned().collect()
        };

        tracing::info!(
            queues = queues.len(),
            immediate,
            "Stopping dispatcher, waiting for destination queues"
        );

        let interval = self.settings.stop_poll_interval();
        while !queues.iter().all(|queue| queue.is_finished()) {
            internal!("Waiting for destination queues to finish");
            tokio::time::sleep(interval).await;
        }

        self.registry.write().queues.clear();
        internal!(level = DEBUG, "Dispatcher stopped");
    }

    fn check_debug_policy(&self, message: &Message) -> Result<(), PolicyError> {
        match message
            .recipients()
            .find(|address| {
                !envelope_address(address).is_ok_and(|bare| self.settings.is_debug_allowed(&bare))
            })
        {
            Some(address) => Err(PolicyError::RecipientNotAllowed {
                address: address.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn apply_defaults(&self, message: &mut Message) {
        if message
            .subject
            .as_deref()
            .is_none_or(|subject| subject.trim().is_empty())
        {
            message.subject = Some(NO_SUBJECT.to_string());
        }

        if message.sent_at.is_none() {
            message.sent_at = Some(Utc::now());
        }

        if self.settings.debug
            && let Some(subject) = &mut message.subject
        {
            subject.insert_str(0, DEBUG_SUBJECT_PREFIX);
        }
    }

    /// Finds or creates the queue for `config`.
    fn queue_for(&self, config: &DestinationConfig) -> Result<Arc<DestinationQueue>, LifecycleError> {
        let mut registry = self.registry.write();
        if registry.stopped {
            return Err(LifecycleError::DispatcherStopped);
        }

        match registry.queues.get(config) {
            Some(queue) if queue.state() != QueueState::Stopped => return Ok(Arc::clone(queue)),
            Some(_) => tracing::warn!(%config, "Replacing destination queue whose worker failed"),
            None => {}
        }

        let destination = Arc::new(config.clone());
        let client = TransportClient::new(
            Arc::clone(&destination),
            &self.settings,
            Arc::clone(&self.connector),
            self.listeners.clone(),
        );
        let queue = DestinationQueue::spawn(
            Arc::clone(&destination),
            &self.settings,
            client,
            Arc::clone(&registry.sink),
        );
        registry.queues.insert(destination, Arc::clone(&queue));

        tracing::debug!(%config, queues = registry.queues.len(), "Created destination queue");
        Ok(queue)
    }

    fn reject(&self, config: &DestinationConfig, message: Message, reason: FailureReason) {
        tracing::debug!(%config, "Rejected message: {reason}");
        self.failed_mail_sink().add(FailedMail::new(
            Arc::new(config.clone()),
            message,
            reason,
        ));
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        if !registry.stopped {
            registry.stopped = true;
            for queue in registry.queues.values() {
                queue.stop_accepting(false);
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("Dispatcher")
            .field("settings", &self.settings)
            .field("queues", &registry.queues.len())
            .field("stopped", &registry.stopped)
            .finish_non_exhaustive()
    }
}

fn validate(message: &Message) -> Result<(), ValidationError> {
    if !message.has_sender() {
        return Err(ValidationError::MissingSender);
    }
    if !message.has_recipients() {
        return Err(ValidationError::MissingRecipients);
    }
    Ok(())
}
