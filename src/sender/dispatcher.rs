//! Asynchronous message dispatch
//!
//! Producers hand messages to [`Dispatcher::send`], which never blocks and
//! never fails: a message either enters the bounded queue or is dropped and
//! logged. Worker tasks drain the queue, borrow a connectable from the pool
//! for each message and hand it back afterwards.
//!
//! The worker set is elastic. It never shrinks below `min_workers`; a worker
//! that picks up a message while more are waiting and nobody else is idle
//! starts a helper, up to `max_workers`. Helpers retire after `idle_time`
//! without work.
//!
//! A transport that panics costs the message it was sending, not the worker.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Handle, TryCurrentError};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify, OnceCell};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Span};

use crate::message::OutboundMessage;
use crate::pool::ConnectablePool;

/// Configuration for the worker set and its queue
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Workers kept alive even without work
    pub min_workers: usize,

    /// Upper bound on concurrent workers
    pub max_workers: usize,

    /// Messages that may wait for a worker
    pub queue_capacity: usize,

    /// How long a worker above the minimum waits for work before retiring
    pub idle_time: Duration,

    /// How long `stop` waits for queued and in-flight sends
    pub shutdown_grace: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            queue_capacity: 8,
            idle_time: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl DispatcherConfig {
    fn check(&self) -> Result<(), DispatchError> {
        if self.min_workers == 0 {
            return Err(DispatchError::InvalidConfig("min_workers must be at least 1".to_string()));
        }
        if self.max_workers < self.min_workers {
            return Err(DispatchError::InvalidConfig(format!(
                "max_workers ({}) must not be below min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }
        if self.queue_capacity == 0 {
            return Err(DispatchError::InvalidConfig("queue_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Error types for dispatch
///
/// Admission errors never reach the producer; they are logged by `send`.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Message {message} rejected: {capacity} messages already queued")]
    AdmissionRejected { message: String, capacity: usize },

    #[error("Message {0} rejected: dispatcher is stopped")]
    Stopped(String),

    #[error("Invalid dispatcher configuration: {0}")]
    InvalidConfig(String),

    #[error("No async runtime available: {0}")]
    NoRuntime(#[from] TryCurrentError),
}

/// Snapshot of dispatcher counters and gauges
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Messages admitted to the queue
    pub accepted: u64,

    /// Messages rejected on admission or discarded at shutdown
    pub dropped: u64,

    /// Messages handed to a transport successfully
    pub sent: u64,

    /// Messages that could not be delivered
    pub failed: u64,

    /// Live workers
    pub workers: usize,

    /// Workers waiting for work
    pub idle_workers: usize,

    /// Messages waiting for a worker
    pub queued: usize,
}

/// Holds a gauge up for as long as it lives
struct Gauge<'a>(&'a AtomicUsize);

impl<'a> Gauge<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Gauge<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One unit of the live worker count, moved into the worker task at spawn
///
/// Dropping it (the worker ended or was aborted) gives the unit back unless
/// the worker already retired through `try_retire`.
struct WorkerSlot {
    shared: Arc<Shared>,
    retired: bool,
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        if !self.retired {
            self.shared.live_workers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

struct Workers {
    tasks: JoinSet<()>,

    /// Set by `stop`; no worker is spawned afterwards
    stopping: bool,

    next_id: u64,
}

struct Shared {
    config: DispatcherConfig,
    pool: Arc<ConnectablePool>,

    /// Producer side; `None` once the dispatcher is stopped
    queue: Mutex<Option<mpsc::Sender<OutboundMessage>>>,

    /// Consumer side, shared by all workers
    inbox: AsyncMutex<mpsc::Receiver<OutboundMessage>>,

    workers: Mutex<Workers>,
    runtime: Handle,

    /// Signalled when a message leaves the queue or the queue closes
    dequeued: Notify,

    live_workers: AtomicUsize,
    idle_workers: AtomicUsize,
    queued: AtomicUsize,

    accepted: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,

    span: Span,
}

/// Elastic worker pool delivering messages through a [`ConnectablePool`]
pub struct Dispatcher {
    shared: Arc<Shared>,

    /// Set once shutdown has completed
    stopped: OnceCell<()>,
}

impl Dispatcher {
    /// Create a dispatcher on the current Tokio runtime and start the minimum workers
    pub fn new(config: DispatcherConfig, pool: Arc<ConnectablePool>) -> Result<Self, DispatchError> {
        Self::with_handle(config, pool, Handle::try_current()?)
    }

    /// Create a dispatcher whose workers run on `runtime`
    pub fn with_handle(
        config: DispatcherConfig,
        pool: Arc<ConnectablePool>,
        runtime: Handle,
    ) -> Result<Self, DispatchError> {
        config.check()?;

        let (queue, inbox) = mpsc::channel(config.queue_capacity);
        let span = info_span!(
            "dispatcher",
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            queue_capacity = config.queue_capacity
        );

        let shared = Arc::new(Shared {
            pool,
            queue: Mutex::new(Some(queue)),
            inbox: AsyncMutex::new(inbox),
            workers: Mutex::new(Workers {
                tasks: JoinSet::new(),
                stopping: false,
                next_id: 0,
            }),
            runtime,
            dequeued: Notify::new(),
            live_workers: AtomicUsize::new(0),
            idle_workers: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            span,
            config,
        });

        for _ in 0..shared.config.min_workers {
            Shared::spawn_worker(&shared);
        }

        info!(parent: &shared.span, "Dispatcher started");

        Ok(Self {
            shared,
            stopped: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    pub fn pool(&self) -> &Arc<ConnectablePool> {
        &self.shared.pool
    }

    /// Queue a message for delivery
    ///
    /// Never blocks and needs no async context. When the queue is full, or
    /// the dispatcher is stopped, the message is dropped and logged.
    pub fn send(&self, message: OutboundMessage) {
        if let Err(e) = self.shared.admit(message) {
            self.shared.dropped.fetch_add(1, Ordering::SeqCst);
            warn!(parent: &self.shared.span, error = %e, "Dropping message");
        }
    }

    /// Wait until the queue has room for another message
    ///
    /// Returns at once when the dispatcher is stopped. With several producers
    /// the room may be taken again before the next `send`.
    pub async fn wait_for_room(&self) {
        let shared = &self.shared;
        loop {
            let dequeued = shared.dequeued.notified();
            if shared.queued.load(Ordering::SeqCst) < shared.config.queue_capacity
                || shared.queue.lock().is_none()
            {
                return;
            }
            dequeued.await;
        }
    }

    /// Stop admission, let queued and in-flight sends finish within the
    /// shutdown grace, then abort what is left and expire the pool
    ///
    /// Only the first call shuts down; concurrent callers wait for it to
    /// finish and later ones return at once.
    pub async fn stop(&self) {
        if self.stopped.initialized() {
            trace!(parent: &self.shared.span, "Dispatcher is already stopped");
        }
        self.stopped.get_or_init(|| self.shutdown()).await;
    }

    async fn shutdown(&self) {
        let shared = &self.shared;
        info!(parent: &shared.span, queued = shared.queued.load(Ordering::SeqCst), "Stopping dispatcher");

        // Workers drain what is queued and exit once the queue reports closed
        shared.close_queue();

        let mut tasks = {
            let mut workers = shared.workers.lock();
            workers.stopping = true;
            std::mem::take(&mut workers.tasks)
        };

        let grace = shared.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                parent: &shared.span,
                grace_ms = grace.as_millis() as u64,
                workers = tasks.len(),
                "Shutdown grace exceeded, aborting workers"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let discarded = shared.discard_queued().await;
        if discarded > 0 {
            warn!(parent: &shared.span, count = discarded, "Discarded undelivered messages");
        }

        shared.pool.expire_all().await;

        let stats = self.stats();
        info!(
            parent: &shared.span,
            accepted = stats.accepted,
            sent = stats.sent,
            failed = stats.failed,
            dropped = stats.dropped,
            "Dispatcher stopped"
        );
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.initialized()
    }

    pub fn stats(&self) -> DispatcherStats {
        let shared = &self.shared;
        DispatcherStats {
            accepted: shared.accepted.load(Ordering::SeqCst),
            dropped: shared.dropped.load(Ordering::SeqCst),
            sent: shared.sent.load(Ordering::SeqCst),
            failed: shared.failed.load(Ordering::SeqCst),
            workers: shared.live_workers.load(Ordering::SeqCst),
            idle_workers: shared.idle_workers.load(Ordering::SeqCst),
            queued: shared.queued.load(Ordering::SeqCst),
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // Lets the workers run out the queue and exit
        self.shared.close_queue();
    }
}

impl Shared {
    fn admit(&self, message: OutboundMessage) -> Result<(), DispatchError> {
        let queue = self.queue.lock();
        let Some(queue) = queue.as_ref() else {
            return Err(DispatchError::Stopped(message.to_string()));
        };

        // Counted before the hand-off so a fast worker never sees it negative
        self.queued.fetch_add(1, Ordering::SeqCst);
        match queue.try_send(message) {
            Ok(()) => {
                self.accepted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                self.queued.fetch_sub(1, Ordering::SeqCst);
                Err(match e {
                    mpsc::error::TrySendError::Full(message) => DispatchError::AdmissionRejected {
                        message: message.to_string(),
                        capacity: self.config.queue_capacity,
                    },
                    mpsc::error::TrySendError::Closed(message) => DispatchError::Stopped(message.to_string()),
                })
            }
        }
    }

    fn close_queue(&self) {
        self.queue.lock().take();
        self.dequeued.notify_waiters();
    }

    /// Start one worker unless stopping or already at the maximum
    fn spawn_worker(shared: &Arc<Self>) -> bool {
        let mut workers = shared.workers.lock();
        if workers.stopping {
            return false;
        }

        let claimed = shared
            .live_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < shared.config.max_workers).then_some(n + 1)
            })
            .is_ok();
        if !claimed {
            return false;
        }

        // Reap retired helpers
        while workers.tasks.try_join_next().is_some() {}

        workers.next_id += 1;
        let id = workers.next_id;
        let slot = WorkerSlot {
            shared: Arc::clone(shared),
            retired: false,
        };
        let span = info_span!(parent: &shared.span, "worker", id = id);
        workers
            .tasks
            .spawn_on(Self::run_worker(slot).instrument(span), &shared.runtime);

        debug!(parent: &shared.span, id = id, "Started worker");
        true
    }

    async fn run_worker(mut slot: WorkerSlot) {
        let shared = Arc::clone(&slot.shared);

        loop {
            let next = {
                let _idle = Gauge::enter(&shared.idle_workers);
                tokio::time::timeout(shared.config.idle_time, async {
                    shared.inbox.lock().await.recv().await
                })
                .await
            };

            match next {
                Ok(Some(message)) => {
                    shared.queued.fetch_sub(1, Ordering::SeqCst);
                    shared.dequeued.notify_waiters();
                    shared.maybe_grow();

                    // The pooled connectable goes back through its drop on unwind
                    let delivery = AssertUnwindSafe(shared.deliver(&message)).catch_unwind().await;
                    if let Err(panic) = delivery {
                        shared.failed.fetch_add(1, Ordering::SeqCst);
                        error!(
                            message = %message,
                            panic = panic_text(panic.as_ref()),
                            "Transport panicked, message lost"
                        );
                    }
                }
                Ok(None) => {
                    debug!("Queue closed, worker exiting");
                    return;
                }
                Err(_) => {
                    if shared.try_retire() {
                        slot.retired = true;
                        debug!("Worker idle, retiring");
                        return;
                    }
                }
            }
        }
    }

    /// Add a helper when work is piling up and nobody is free to take it
    fn maybe_grow(self: &Arc<Self>) {
        if self.queued.load(Ordering::SeqCst) > 0 && self.idle_workers.load(Ordering::SeqCst) == 0 {
            Self::spawn_worker(self);
        }
    }

    fn try_retire(&self) -> bool {
        let min = self.config.min_workers;
        self.live_workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n > min).then(|| n - 1))
            .is_ok()
    }

    async fn deliver(&self, message: &OutboundMessage) {
        let pooled = match self.pool.acquire().await {
            Ok(pooled) => pooled,
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                error!(message = %message, error = %e, "No connectable available, message lost");
                return;
            }
        };

        let result = pooled.send(message).await;
        let connectable = pooled.id();
        self.pool.release(pooled).await;

        match result {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::SeqCst);
                trace!(message = %message, connectable = connectable, "Message sent");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                error!(message = %message, connectable = connectable, error = %e, "Failed to send message");
            }
        }
    }

    /// Drop whatever is still queued once no worker is left to take it
    async fn discard_queued(&self) -> usize {
        let mut inbox = self.inbox.lock().await;
        let mut discarded = 0;
        while inbox.try_recv().is_ok() {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            self.dropped.fetch_add(1, Ordering::SeqCst);
            discarded += 1;
        }
        self.dequeued.notify_waiters();
        discarded
    }
}

fn panic_text(panic: &(dyn Any + Send)) -> &str {
    if let Some(text) = panic.downcast_ref::<&'static str>() {
        *text
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.as_str()
    } else {
        "non-string panic payload"
    }
}
