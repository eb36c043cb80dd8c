use super::config::{BackpressurePolicy, DispatcherConfig};
use super::store::Change;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Observer of store changes
///
/// Methods run on the handler's own worker task, one notification at a
/// time, in the order the store was mutated.
pub trait ResourceEventHandler<K>: Send + Sync + 'static {
    fn on_add(&self, obj: &K);
    fn on_update(&self, old: &K, new: &K);
    fn on_delete(&self, obj: &K);
}

type AddFn<K> = Box<dyn Fn(&K) + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&K, &K) + Send + Sync>;

/// Handler assembled from optional closures; missing ones ignore the event
pub struct ResourceEventHandlerFuncs<K> {
    add: Option<AddFn<K>>,
    update: Option<UpdateFn<K>>,
    delete: Option<AddFn<K>>,
}

impl<K> Default for ResourceEventHandlerFuncs<K> {
    fn default() -> Self {
        Self {
            add: None,
            update: None,
            delete: None,
        }
    }
}

impl<K> ResourceEventHandlerFuncs<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn add_fn(mut self, f: impl Fn(&K) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn update_fn(mut self, f: impl Fn(&K, &K) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn delete_fn(mut self, f: impl Fn(&K) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<K: 'static> ResourceEventHandler<K> for ResourceEventHandlerFuncs<K> {
    fn on_add(&self, obj: &K) {
        if let Some(f) = &self.add {
            f(obj);
        }
    }

    fn on_update(&self, old: &K, new: &K) {
        if let Some(f) = &self.update {
            f(old, new);
        }
    }

    fn on_delete(&self, obj: &K) {
        if let Some(f) = &self.delete {
            f(obj);
        }
    }
}

/// Predicate selecting which objects a handler sees
pub type EventFilter<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(Uuid);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

enum Queue<K> {
    Blocking {
        tx: mpsc::Sender<Change<K>>,
        timeout: Duration,
    },
    Lossy(broadcast::Sender<Change<K>>),
}

impl<K> Clone for Queue<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Blocking { tx, timeout } => Self::Blocking {
                tx: tx.clone(),
                timeout: *timeout,
            },
            Self::Lossy(tx) => Self::Lossy(tx.clone()),
        }
    }
}

struct Registration<K> {
    id: HandlerId,
    queue: Queue<K>,
    filter: Option<EventFilter<K>>,
    task: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Counters {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherStats {
    pub active_handlers: usize,
    /// Notifications queued for some handler
    pub dispatched: u64,
    /// Notifications a handler has finished processing
    pub delivered: u64,
    /// Notifications lost to backpressure
    pub dropped: u64,
}

/// Fan-out of store changes to registered handlers.
///
/// Every registration owns a bounded queue drained by its own worker task,
/// so a slow handler delays only itself and never grows memory without
/// bound.
pub struct Dispatcher<K> {
    registrations: RwLock<Vec<Registration<K>>>,
    config: DispatcherConfig,
    counters: Arc<Counters>,
    shutdown: CancellationToken,
}

impl<K> fmt::Debug for Dispatcher<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl<K: Send + Sync + 'static> Default for Dispatcher<K> {
    fn default() -> Self {
        Self::new(DispatcherConfig::default())
    }
}

impl<K: Send + Sync + 'static> Dispatcher<K> {
    #[must_use]
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            config: DispatcherConfig {
                queue_capacity: config.queue_capacity.max(1),
                ..config
            },
            counters: Arc::new(Counters::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a handler for all subsequent changes
    pub async fn register(&self, handler: impl ResourceEventHandler<K>) -> HandlerId {
        self.add_registration(Arc::new(handler), None).await
    }

    /// Register a handler that only sees objects accepted by `filter`
    pub async fn register_filtered(
        &self,
        handler: impl ResourceEventHandler<K>,
        filter: impl Fn(&K) -> bool + Send + Sync + 'static,
    ) -> HandlerId {
        self.add_registration(Arc::new(handler), Some(Arc::new(filter)))
            .await
    }

    #[allow(clippy::significant_drop_tightening)]
    pub(crate) async fn add_registration(
        &self,
        handler: Arc<dyn ResourceEventHandler<K>>,
        filter: Option<EventFilter<K>>,
    ) -> HandlerId {
        let id = HandlerId(Uuid::new_v4());
        let capacity = self.config.queue_capacity;
        let token = self.shutdown.child_token();
        let counters = Arc::clone(&self.counters);

        let (queue, task) = match self.config.policy {
            BackpressurePolicy::Block { timeout } => {
                let (tx, rx) = mpsc::channel(capacity);
                let task = tokio::spawn(run_blocking_worker(id, handler, rx, token, counters));
                (Queue::Blocking { tx, timeout }, task)
            }
            BackpressurePolicy::DropOldest => {
                let (tx, rx) = broadcast::channel(capacity);
                let task = tokio::spawn(run_lossy_worker(id, handler, rx, token, counters));
                (Queue::Lossy(tx), task)
            }
        };

        let mut registrations = self.registrations.write().await;
        registrations.push(Registration {
            id,
            queue,
            filter,
            task,
        });
        debug!(handler = %id, total = registrations.len(), "handler registered");
        id
    }

    /// Remove a handler. Notifications already queued for it are still
    /// delivered; nothing dispatched afterwards reaches it.
    pub async fn unregister(&self, id: HandlerId) -> bool {
        let removed = {
            let mut registrations = self.registrations.write().await;
            registrations
                .iter()
                .position(|r| r.id == id)
                .map(|idx| registrations.remove(idx))
        };
        // dropping the queue sender lets the worker drain and exit
        match removed {
            Some(registration) => {
                debug!(handler = %registration.id, "handler unregistered");
                true
            }
            None => false,
        }
    }

    /// Queue `change` for every registered handler.
    ///
    /// Returns once the change is queued everywhere, or once the blocking
    /// timeout expired for the handlers whose queue stayed full.
    pub async fn dispatch(&self, change: Change<K>) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let targets: Vec<(HandlerId, Queue<K>, Option<EventFilter<K>>)> = self
            .registrations
            .read()
            .await
            .iter()
            .map(|r| (r.id, r.queue.clone(), r.filter.clone()))
            .collect();

        for (id, queue, filter) in targets {
            let Some(change) = filtered(&change, filter.as_ref()) else {
                continue;
            };
            match queue {
                Queue::Blocking { tx, timeout } => {
                    match tx.send_timeout(change, timeout).await {
                        Ok(()) => {
                            self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                handler = %id,
                                "⚠️ handler queue full for {:?}, dropping notification",
                                timeout
                            );
                        }
                        Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(handler = %id, "handler worker gone, dropping notification");
                        }
                    }
                }
                Queue::Lossy(tx) => {
                    if tx.send(change).is_ok() {
                        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                    } else {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(handler = %id, "handler worker gone, dropping notification");
                    }
                }
            }
        }
    }

    pub async fn active_handlers(&self) -> usize {
        self.registrations.read().await.len()
    }

    pub async fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            active_handlers: self.active_handlers().await,
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Stop all workers; queued notifications are discarded and further
    /// dispatches are ignored
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let registrations = std::mem::take(&mut *self.registrations.write().await);
        info!(handlers = registrations.len(), "📡 dispatcher shutting down");
        for registration in registrations {
            registration.task.abort();
        }
    }
}

/// Translate a change into what a filtered handler should observe
fn filtered<K: 'static>(change: &Change<K>, filter: Option<&EventFilter<K>>) -> Option<Change<K>> {
    let Some(filter) = filter else {
        return Some(change.clone());
    };
    match change {
        Change::Added(obj) | Change::Deleted(obj) => filter(obj.as_ref()).then(|| change.clone()),
        Change::Updated { old, new } => match (filter(old.as_ref()), filter(new.as_ref())) {
            (true, true) => Some(change.clone()),
            (false, true) => Some(Change::Added(Arc::clone(new))),
            (true, false) => Some(Change::Deleted(Arc::clone(old))),
            (false, false) => None,
        },
    }
}

/// Run one callback; a panicking handler loses the notification but keeps
/// its worker
fn deliver<K: 'static>(
    id: HandlerId,
    handler: &dyn ResourceEventHandler<K>,
    change: &Change<K>,
    counters: &Counters,
) {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match change {
        Change::Added(obj) => handler.on_add(obj),
        Change::Updated { old, new } => handler.on_update(old, new),
        Change::Deleted(obj) => handler.on_delete(obj),
    }));
    if outcome.is_ok() {
        counters.delivered.fetch_add(1, Ordering::Relaxed);
    } else {
        counters.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(handler = %id, "⚠️ handler panicked, notification dropped");
    }
}

async fn run_blocking_worker<K: Send + Sync + 'static>(
    id: HandlerId,
    handler: Arc<dyn ResourceEventHandler<K>>,
    mut rx: mpsc::Receiver<Change<K>>,
    token: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        let change = tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = rx.recv() => match next {
                Some(change) => change,
                None => break,
            },
        };
        deliver(id, handler.as_ref(), &change, &counters);
    }
    debug!(handler = %id, "handler worker stopped");
}

async fn run_lossy_worker<K: Send + Sync + 'static>(
    id: HandlerId,
    handler: Arc<dyn ResourceEventHandler<K>>,
    mut rx: broadcast::Receiver<Change<K>>,
    token: CancellationToken,
    counters: Arc<Counters>,
) {
    loop {
        let change = tokio::select! {
            biased;
            () = token.cancelled() => break,
            next = rx.recv() => match next {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    counters.dropped.fetch_add(skipped, Ordering::Relaxed);
                    warn!(handler = %id, skipped, "⚠️ slow handler, oldest notifications dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        };
        deliver(id, handler.as_ref(), &change, &counters);
    }
    debug!(handler = %id, "handler worker stopped");
}
