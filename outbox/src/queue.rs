//! Bounded per-destination queue and its worker task.

use std::{
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tokio::{sync::Notify, task::JoinHandle};

use crate::{
    config::{DestinationConfig, DispatcherSettings},
    error::LifecycleError,
    internal,
    listener::panic_message,
    message::Message,
    sink::{FailedMail, FailedMailSink, FailureReason},
    transport::TransportClient,
};

/// Lifecycle of a [`DestinationQueue`]: `Active → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    /// Accepting messages.
    Active,
    /// Refusing new messages; the worker finishes what it has.
    Stopping,
    /// The worker has exited.
    Stopped,
}

struct Buffer {
    messages: VecDeque<Message>,
    state: QueueState,
}

/// A bounded FIFO of messages for one destination, drained in batches by a
/// dedicated worker task.
///
/// Every change to the buffer is announced on `changed`, which both blocked
/// producers and the idle worker wait on.
pub struct DestinationQueue {
    destination: Arc<DestinationConfig>,
    capacity: usize,
    batch_size: usize,
    buffer: Mutex<Buffer>,
    changed: Notify,
    sink: RwLock<Arc<dyn FailedMailSink>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DestinationQueue {
    /// Creates the queue and spawns its worker on the current tokio runtime.
    #[must_use]
    pub fn spawn(
        destination: Arc<DestinationConfig>,
        settings: &DispatcherSettings,
        client: TransportClient,
        sink: Arc<dyn FailedMailSink>,
    ) -> Arc<Self> {
        let queue = Arc::new(Self {
            destination,
            capacity: settings.queue_capacity.max(1),
            batch_size: settings.batch_size.max(1),
            buffer: Mutex::new(Buffer {
                messages: VecDeque::new(),
                state: QueueState::Active,
            }),
            changed: Notify::new(),
            sink: RwLock::new(sink),
            worker: Mutex::new(None),
        });

        let handle = tokio::spawn(Arc::clone(&queue).run(client));
        *queue.worker.lock() = Some(handle);

        internal!("Started queue for {}", queue.destination);
        queue
    }

    #[must_use]
    pub const fn destination(&self) -> &Arc<DestinationConfig> {
        &self.destination
    }

    /// Messages buffered and not yet handed to the worker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn state(&self) -> QueueState {
        self.buffer.lock().state
    }

    /// Whether the worker task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Replaces the sink future failures are written to.
    pub fn set_sink(&self, sink: Arc<dyn FailedMailSink>) {
        *self.sink.write() = sink;
    }

    /// Appends a message, waiting while the queue is full.
    ///
    /// The message is handed back if the queue stops accepting before it could
    /// be buffered. Dropping the returned future while it waits drops the
    /// message with it.
    pub async fn enqueue(&self, message: Message) -> Result<(), (Message, LifecycleError)> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut buffer = self.buffer.lock();
                if buffer.state != QueueState::Active {
                    return Err((message, LifecycleError::QueueStopped));
                }
                if buffer.messages.len() < self.capacity {
                    buffer.messages.push_back(message);
                    drop(buffer);
                    self.changed.notify_waiters();
                    return Ok(());
                }
            }

            changed.await;
        }
    }

    /// Stops accepting messages.
    ///
    /// With `immediate`, everything still buffered is written to the sink as a
    /// lifecycle failure; the batch the worker is currently sending is left
    /// alone. Otherwise the worker drains the buffer normally before exiting.
    pub fn stop_accepting(&self, immediate: bool) {
        let drained = {
            let mut buffer = self.buffer.lock();
            if buffer.state == QueueState::Active {
                buffer.state = QueueState::Stopping;
            }
            if immediate {
                std::mem::take(&mut buffer.messages)
            } else {
                VecDeque::new()
            }
        };
        self.changed.notify_waiters();

        if !drained.is_empty() {
            tracing::info!(
                destination = %self.destination,
                count = drained.len(),
                "Discarding buffered messages on immediate stop"
            );
        }
        for message in drained {
            self.fail(message, FailureReason::Lifecycle(LifecycleError::DrainedOnStop));
        }
    }

    /// Writes a failure to the sink that is current right now.
    ///
    /// A panicking sink loses the record; it is logged but never takes the
    /// worker down with it.
    pub fn fail(&self, message: Message, reason: FailureReason) {
        let sink = Arc::clone(&self.sink.read());
        let record = FailedMail::new(Arc::clone(&self.destination), message, reason);
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| sink.add(record))) {
            tracing::error!(
                destination = %self.destination,
                "Failed-mail sink panicked, record lost: {}",
                panic_message(&*panic)
            );
        }
    }

    async fn run(self: Arc<Self>, client: TransportClient) {
        let client = Arc::new(client);

        while let Some(batch) = self.next_batch().await {
            let size = batch.len();

            // A panic while sending surfaces here as a `JoinError`
            let sending = tokio::spawn({
                let client = Arc::clone(&client);
                let batch = batch.clone();
                async move { client.send(batch).await }
            });

            let report = match sending.await {
                Ok(report) => report,
                Err(e) => {
                    tracing::error!(
                        destination = %self.destination,
                        batch_size = size,
                        "Delivery of batch failed: {e}"
                    );
                    self.abandon(batch);
                    return;
                }
            };

            internal!(
                "Batch for {} finished: {} of {} delivered",
                self.destination,
                report.delivered,
                size
            );

            for (message, outcome) in report.failures {
                self.fail(message, FailureReason::Delivery(outcome));
            }
        }

        internal!("Queue for {} stopped", self.destination);
    }

    /// Stops the queue after its worker failed, recording the batch it was
    /// sending and everything still buffered.
    fn abandon(&self, in_flight: Vec<Message>) {
        let buffered = {
            let mut buffer = self.buffer.lock();
            buffer.state = QueueState::Stopped;
            std::mem::take(&mut buffer.messages)
        };
        self.changed.notify_waiters();

        for message in in_flight.into_iter().chain(buffered) {
            self.fail(message, FailureReason::Lifecycle(LifecycleError::WorkerFailed));
        }
    }

    /// Takes up to `batch_size` messages, waiting while the queue is empty.
    ///
    /// Returns `None`, after moving to [`QueueState::Stopped`], once the queue is
    /// stopping and empty.
    async fn next_batch(&self) -> Option<Vec<Message>> {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut buffer = self.buffer.lock();
                if !buffer.messages.is_empty() {
                    let count = buffer.messages.len().min(self.batch_size);
                    let batch = buffer.messages.drain(..count).collect();
                    drop(buffer);
                    self.changed.notify_waiters();
                    return Some(batch);
                }
                if buffer.state != QueueState::Active {
                    buffer.state = QueueState::Stopped;
                    drop(buffer);
                    self.changed.notify_waiters();
                    return None;
                }
            }

            changed.await;
        }
    }
}

impl std::fmt::Debug for DestinationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationQueue")
            .field("destination", &self.destination)
            .field("capacity", &self.capacity)
            .field("batch_size", &self.batch_size)
            .field("len", &self.len())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
