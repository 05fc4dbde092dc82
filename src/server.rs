//! Worker pool and subscription scheduling.
//!
//! The server owns one queue and one load counter per send worker. Clients are
//! pinned to a worker by hashing their address, so all messages to a client leave
//! through the same sockets in order.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    io,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::mpsc,
    task::{AbortHandle, JoinHandle},
    time::{self, Instant},
};

use crate::{
    client::Job,
    configuration::{Configuration, ConfigurationError},
    stats::Stats,
    transport::{Transport, TransportError, UdpTransport},
    worker::{SendWorker, WorkerError},
};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("Failed to spawn thread for worker {worker}: {source}")]
    Spawn { worker: usize, source: io::Error },
    #[error("Queue of worker {0} is closed")]
    QueueClosed(usize),
    #[error("Worker {0} panicked")]
    Panicked(usize),
    #[error("Waiting for the workers failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Producer side of one send worker.
///
/// The server holds the only long-lived sender of each queue, so dropping the
/// server's handles is what closes the queues.
pub struct WorkerHandle {
    id: usize,
    queue: mpsc::Sender<Job>,
    load: Arc<AtomicI64>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Number of active subscriptions assigned to the worker.
    pub fn load(&self) -> i64 {
        self.load.load(Ordering::Relaxed)
    }
}

/// Expiry of a subscription, `None` once it has ended.
struct Grant(Mutex<Option<Instant>>);

impl Grant {
    fn new(duration: Duration) -> Self {
        Grant(Mutex::new(Some(Instant::now() + duration)))
    }

    fn expiry(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves the expiry to `duration` from now. Fails once the grant has ended.
    fn extend(&self, duration: Duration) -> bool {
        let mut expiry = self.expiry();
        match *expiry {
            Some(_) => {
                *expiry = Some(Instant::now() + duration);
                true
            }
            None => false,
        }
    }

    /// Whether the grant still runs; ends it when the expiry has passed.
    fn is_active(&self) -> bool {
        let mut expiry = self.expiry();
        match *expiry {
            Some(at) if Instant::now() < at => true,
            _ => {
                *expiry = None;
                false
            }
        }
    }

    fn end(&self) {
        *self.expiry() = None;
    }
}

struct Subscription {
    client: Job,
    grant: Arc<Grant>,
    task: AbortHandle,
}

/// Pool of send workers plus the tasks that feed them.
pub struct Server {
    workers: Vec<WorkerHandle>,
    threads: Vec<(usize, thread::JoinHandle<Result<(), WorkerError>>)>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl Server {
    /// Opens the sockets of every worker, then starts the worker threads.
    pub fn start(config: Arc<Configuration>, stats: Arc<dyn Stats>) -> Result<Self, ServerError> {
        let conf = config.clone();
        Self::start_with(config, stats, move |_| UdpTransport::open(&conf))
    }

    /// Like [`Server::start`] but with transports built by `open`.
    ///
    /// Every transport is created before any thread starts; a setup failure
    /// leaves nothing running.
    pub fn start_with<T, F>(
        config: Arc<Configuration>,
        stats: Arc<dyn Stats>,
        mut open: F,
    ) -> Result<Self, ServerError>
    where
        T: Transport + Send + 'static,
        F: FnMut(usize) -> Result<T, TransportError>,
    {
        if config.workers == 0 {
            return Err(ConfigurationError::NoWorkers.into());
        }
        if config.queue_size == 0 {
            return Err(ConfigurationError::ZeroQueueSize.into());
        }

        let mut workers = Vec::with_capacity(config.workers);
        let mut pending = Vec::with_capacity(config.workers);
        for id in 0..config.workers {
            let transport = open(id).map_err(|source| WorkerError::Setup { worker: id, source })?;
            let (tx, rx) = mpsc::channel(config.queue_size);
            let load = Arc::new(AtomicI64::new(0));
            pending.push(SendWorker::with_transport(
                id,
                rx,
                load.clone(),
                config.clone(),
                stats.clone(),
                transport,
            ));
            workers.push(WorkerHandle {
                id,
                queue: tx,
                load,
            });
        }

        let mut threads = Vec::with_capacity(pending.len());
        for worker in pending {
            let id = worker.id();
            let handle = thread::Builder::new()
                .name(format!("ptp-tx-{}", id))
                .spawn(move || worker.run())
                .map_err(|source| ServerError::Spawn { worker: id, source })?;
            threads.push((id, handle));
        }
        log::info!("Started {} send workers", threads.len());

        Ok(Server {
            workers,
            threads,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    /// Worker responsible for `client`.
    pub fn find_worker(&self, client: &Job) -> &WorkerHandle {
        let mut hasher = DefaultHasher::new();
        client.event_addr().ip().hash(&mut hasher);
        let index = (hasher.finish() % self.workers.len() as u64) as usize;
        &self.workers[index]
    }

    fn subscriptions(&self) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueues `client` every granted interval for `duration`.
    ///
    /// Always starts a new subscription task; [`Server::renew`] extends a running
    /// one instead. The worker's load counts the subscription while it is
    /// active. Must be called from within a tokio runtime.
    pub fn subscribe(&self, client: Job, duration: Duration) -> JoinHandle<()> {
        let worker = self.find_worker(&client);
        let worker_id = worker.id;
        let queue = worker.queue.downgrade();
        let load = worker.load.clone();
        let grant = Arc::new(Grant::new(duration));

        let task = tokio::spawn({
            let client = client.clone();
            let grant = grant.clone();
            async move {
                load.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "Subscription {} for {} on worker {} for {:?}",
                    client.subscription(),
                    client.event_addr().ip(),
                    worker_id,
                    duration
                );

                let mut ticker = time::interval(client.interval());
                loop {
                    ticker.tick().await;
                    if !grant.is_active() {
                        break;
                    }
                    let sent = match queue.upgrade() {
                        Some(queue) => queue.send(client.clone()).await.is_ok(),
                        None => false,
                    };
                    if !sent {
                        log::debug!("Worker {} queue closed, ending subscription", worker_id);
                        grant.end();
                        break;
                    }
                }

                load.fetch_sub(1, Ordering::Relaxed);
                log::debug!(
                    "Subscription {} for {} expired",
                    client.subscription(),
                    client.event_addr().ip()
                );
            }
        });

        let mut subscriptions = self.subscriptions();
        subscriptions.retain(|s| !s.task.is_finished());
        subscriptions.push(Subscription {
            client,
            grant,
            task: task.abort_handle(),
        });
        task
    }

    /// Extends the running subscription of `client` to `duration` from now, or
    /// starts one when none is running.
    ///
    /// Returns the handle of the new task, `None` when an existing one was
    /// extended.
    pub fn renew(&self, client: Job, duration: Duration) -> Option<JoinHandle<()>> {
        let extended = self
            .subscriptions()
            .iter()
            .filter(|s| Arc::ptr_eq(&s.client, &client))
            .any(|s| s.grant.extend(duration));
        if extended {
            log::trace!(
                "Extended subscription {} for {}",
                client.subscription(),
                client.event_addr().ip()
            );
            return None;
        }
        Some(self.subscribe(client, duration))
    }

    /// Enqueues a single job, e.g. a prepared Delay-Response.
    pub async fn dispatch(&self, client: Job) -> Result<(), ServerError> {
        let worker = self.find_worker(&client);
        worker
            .queue
            .send(client)
            .await
            .map_err(|_| ServerError::QueueClosed(worker.id))
    }

    /// Stops the subscriptions, closes the queues and waits for the workers.
    ///
    /// Returns the first worker failure, if any.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        for subscription in std::mem::take(&mut *self.subscriptions()) {
            subscription.grant.end();
            subscription.task.abort();
        }
        drop(self.workers);

        let threads = self.threads;
        let joined = tokio::task::spawn_blocking(move || {
            let mut first_error = None;
            for (id, handle) in threads {
                let result = match handle.join() {
                    Ok(result) => result.map_err(ServerError::from),
                    Err(_) => Err(ServerError::Panicked(id)),
                };
                if let Err(e) = result {
                    log::error!("{}", e);
                    first_error.get_or_insert(e);
                }
            }
            first_error
        })
        .await?;

        match joined {
            None => {
                log::info!("All send workers stopped");
                Ok(())
            }
            Some(e) => Err(e),
        }
    }
}
