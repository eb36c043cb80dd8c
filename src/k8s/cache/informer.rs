/**
 * Informer
 *
 * Wires a source, a store, a dispatcher and a reflector together and runs
 * the reflector on a background task. The returned handle is the only way
 * to observe or stop it.
 */
use super::config::{DispatcherConfig, ReflectorConfig};
use super::dispatcher::{Dispatcher, DispatcherStats, EventFilter, ResourceEventHandler};
use super::reflector::{Reflector, ReflectorStats, SyncStatus};
use super::source::{ListWatch, ListerWatcher};
use super::store::Store;
use crate::error::Result;
use crate::k8s::resource_client::{ListOptions, ResourceClient};
use kube::Resource;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type PendingHandler<K> = (Arc<dyn ResourceEventHandler<K>>, Option<EventFilter<K>>);

pub struct Informer<K, L> {
    name: String,
    source: L,
    reflector_config: ReflectorConfig,
    dispatcher_config: DispatcherConfig,
    handlers: Vec<PendingHandler<K>>,
}

impl<K> Informer<K, ListWatch<K>>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    ListWatch<K>: ListerWatcher<K>,
{
    /// Informer over a typed client, listing and watching with `options`
    pub fn for_client(client: ResourceClient<K>, options: ListOptions) -> Self {
        Self::new(ListWatch::new(client, options))
    }
}

impl<K, L> Informer<K, L>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    L: ListerWatcher<K> + 'static,
{
    pub fn new(source: L) -> Self {
        Self {
            name: std::any::type_name::<K>()
                .rsplit("::")
                .next()
                .unwrap_or("informer")
                .to_string(),
            source,
            reflector_config: ReflectorConfig::default(),
            dispatcher_config: DispatcherConfig::default(),
            handlers: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn reflector_config(mut self, config: ReflectorConfig) -> Self {
        self.reflector_config = config;
        self
    }

    #[must_use]
    pub const fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Replay the whole store to every handler each `period`; zero disables
    #[must_use]
    pub fn resync(mut self, period: Duration) -> Self {
        self.reflector_config = self.reflector_config.resync_period(period);
        self
    }

    /// Handler registered before the first list, so it sees every object
    #[must_use]
    pub fn handler(mut self, handler: impl ResourceEventHandler<K>) -> Self {
        self.handlers.push((Arc::new(handler), None));
        self
    }

    #[must_use]
    pub fn filtered_handler(
        mut self,
        handler: impl ResourceEventHandler<K>,
        filter: impl Fn(&K) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.handlers
            .push((Arc::new(handler), Some(Arc::new(filter))));
        self
    }

    /// Register the handlers and spawn the reflector
    pub async fn start(self) -> InformerHandle<K> {
        let store = Arc::new(Store::new());
        let dispatcher = Arc::new(Dispatcher::new(self.dispatcher_config));
        for (handler, filter) in self.handlers {
            dispatcher.add_registration(handler, filter).await;
        }

        let reflector = Reflector::new(
            self.source,
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            self.reflector_config,
        )
        .named(self.name.clone());
        let status = reflector.status();
        let stats = reflector.stats_handle();

        let token = CancellationToken::new();
        let task = {
            let token = token.clone();
            tokio::spawn(async move { reflector.run(token).await })
        };
        info!(informer = %self.name, "🚀 informer started");

        InformerHandle {
            name: self.name,
            store,
            dispatcher,
            status,
            stats,
            token,
            task,
        }
    }
}

/// Controller handle of a running informer
pub struct InformerHandle<K> {
    name: String,
    store: Arc<Store<K>>,
    dispatcher: Arc<Dispatcher<K>>,
    status: watch::Receiver<SyncStatus>,
    stats: Arc<std::sync::RwLock<ReflectorStats>>,
    token: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl<K: Send + Sync + 'static> InformerHandle<K> {
    pub const fn store(&self) -> &Arc<Store<K>> {
        &self.store
    }

    /// Handlers may be added or removed while the informer runs
    pub const fn dispatcher(&self) -> &Arc<Dispatcher<K>> {
        &self.dispatcher
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    #[must_use]
    pub fn stats(&self) -> ReflectorStats {
        self.stats
            .read()
            .map_or_else(|_| ReflectorStats::default(), |stats| stats.clone())
    }

    pub async fn dispatcher_stats(&self) -> DispatcherStats {
        self.dispatcher.stats().await
    }

    /// True once the first full list has been applied to the store
    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.stats().relists > 0
    }

    #[must_use]
    pub fn last_sync_resource_version(&self) -> Option<String> {
        self.stats().last_sync_resource_version
    }

    /// True when the reflector task has ended, successfully or not
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait until the first list is applied or the reflector stops.
    /// Returns whether the informer synced.
    pub async fn wait_for_sync(&self) -> bool {
        let mut status = self.status.clone();
        let reached = status
            .wait_for(|s| {
                matches!(
                    s,
                    SyncStatus::Watching { .. } | SyncStatus::Stopped | SyncStatus::Failed(_)
                )
            })
            .await;
        if reached.is_err() {
            debug!(informer = %self.name, "reflector gone before sync");
        }
        self.has_synced()
    }

    /// Stop the reflector, wait for it, then stop every handler worker.
    ///
    /// # Errors
    ///
    /// Returns the reflector's terminal error if it had already failed, or
    /// the join error if its task panicked
    pub async fn shutdown(self) -> Result<()> {
        info!(informer = %self.name, "🛑 informer shutting down");
        self.token.cancel();
        let outcome = self.task.await;
        self.dispatcher.shutdown().await;
        match outcome? {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(informer = %self.name, "reflector ended with error: {}", e);
                Err(e)
            }
        }
    }
}
