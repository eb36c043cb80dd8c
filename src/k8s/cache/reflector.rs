/**
 * Reflector
 *
 * Keeps a `Store` in sync with the server through list + watch, and feeds
 * every store mutation to the `Dispatcher`. Relists on a stale resource
 * version, rewatches from the last checkpoint on any other disconnect.
 */
use super::config::ReflectorConfig;
use super::dispatcher::Dispatcher;
use super::source::ListerWatcher;
use super::store::{Change, Store};
use crate::error::{Error, Result};
use crate::k8s::resource_client::{EventStream, display_ref};
use futures::StreamExt;
use kube::api::WatchEvent;
use kube::{Resource, ResourceExt};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Relisting,
    Watching,
}

/// Liveness of the sync loop, published on every transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    Starting,
    Relisting,
    Watching { resource_version: String },
    Backoff { attempt: u32, delay: Duration },
    Stopped,
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReflectorStats {
    pub relists: u64,
    pub watch_sessions: u64,
    pub events_applied: u64,
    pub failures: u64,
    pub resyncs: u64,
    pub last_sync_resource_version: Option<String>,
}

/// Exponential backoff between failed attempts
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay to apply now; the following one is doubled up to the maximum
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub const fn reset(&mut self) {
        self.next = self.initial;
    }
}

/// How a single watch session ended
enum WatchEnd {
    Closed,
    Stale,
    Failed(Error),
    Cancelled,
}

pub struct Reflector<K, L> {
    name: String,
    source: L,
    store: Arc<Store<K>>,
    dispatcher: Arc<Dispatcher<K>>,
    config: ReflectorConfig,
    status_tx: watch::Sender<SyncStatus>,
    stats: Arc<std::sync::RwLock<ReflectorStats>>,
}

impl<K, L> Reflector<K, L>
where
    K: Resource + Clone + Debug + Send + Sync + 'static,
    L: ListerWatcher<K>,
{
    pub fn new(
        source: L,
        store: Arc<Store<K>>,
        dispatcher: Arc<Dispatcher<K>>,
        config: ReflectorConfig,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::Starting);
        Self {
            name: "reflector".to_string(),
            source,
            store,
            dispatcher,
            config,
            status_tx,
            stats: Arc::new(std::sync::RwLock::new(ReflectorStats::default())),
        }
    }

    /// Label used in log lines, typically the resource kind
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub const fn store(&self) -> &Arc<Store<K>> {
        &self.store
    }

    pub(crate) fn stats_handle(&self) -> Arc<std::sync::RwLock<ReflectorStats>> {
        Arc::clone(&self.stats)
    }

    #[must_use]
    pub fn stats(&self) -> ReflectorStats {
        self.stats
            .read()
            .map_or_else(|_| ReflectorStats::default(), |stats| stats.clone())
    }

    /// Run the relist/watch loop until `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Returns the error when it is fatal (bad credentials, forbidden,
    /// unusable config), or `Error::RetriesExhausted` after
    /// `max_consecutive_failures` failed attempts in a row. Cancellation
    /// returns `Ok(())`.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        info!(reflector = %self.name, "🔍 reflector starting");

        let mut state = SyncState::Relisting;
        let mut checkpoint = String::new();
        let mut backoff = Backoff::new(self.config.initial_backoff, self.config.max_backoff);
        let mut failures = 0_u32;
        let mut resync = self.config.resync_period.filter(|p| !p.is_zero()).map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });

        loop {
            if token.is_cancelled() {
                break;
            }

            let delay = match state {
                SyncState::Relisting => {
                    self.publish(SyncStatus::Relisting);
                    match self.relist(&token).await {
                        Ok(Some(resource_version)) => {
                            info!(
                                reflector = %self.name,
                                resource_version = %resource_version,
                                "relisted"
                            );
                            checkpoint = resource_version;
                            failures = 0;
                            backoff.reset();
                            state = SyncState::Watching;
                            continue;
                        }
                        Ok(None) => break,
                        Err(e) => self.on_failure(e, &mut failures, &mut backoff, "relist")?,
                    }
                }
                SyncState::Watching => {
                    self.publish(SyncStatus::Watching {
                        resource_version: checkpoint.clone(),
                    });
                    let (end, applied) = self.watch(&mut checkpoint, &token, &mut resync).await;
                    if applied > 0 {
                        failures = 0;
                        backoff.reset();
                    }
                    match end {
                        WatchEnd::Cancelled => break,
                        WatchEnd::Stale => {
                            info!(
                                reflector = %self.name,
                                resource_version = %checkpoint,
                                "resource version too old, relisting"
                            );
                            state = SyncState::Relisting;
                            continue;
                        }
                        WatchEnd::Closed => {
                            debug!(reflector = %self.name, applied, "watch stream ended normally, rewatching");
                            backoff.reset();
                            backoff.next_delay()
                        }
                        WatchEnd::Failed(e) => {
                            self.on_failure(e, &mut failures, &mut backoff, "watch")?
                        }
                    }
                }
            };

            self.publish(SyncStatus::Backoff {
                attempt: failures,
                delay,
            });
            if !pause(delay, &token).await {
                break;
            }
        }

        info!(reflector = %self.name, "🛑 reflector stopped");
        self.publish(SyncStatus::Stopped);
        Ok(())
    }

    /// Count a failure; returns the backoff delay, or the terminal error
    fn on_failure(
        &self,
        error: Error,
        failures: &mut u32,
        backoff: &mut Backoff,
        phase: &str,
    ) -> Result<Duration> {
        self.update_stats(|stats| stats.failures += 1);

        if error.is_fatal() {
            error!(reflector = %self.name, phase, "❌ unrecoverable error: {}", error);
            self.publish(SyncStatus::Failed(error.to_string()));
            return Err(error);
        }

        *failures += 1;
        if *failures > self.config.max_consecutive_failures {
            error!(
                reflector = %self.name,
                phase,
                "❌ exceeded maximum restart attempts ({}), stopping",
                self.config.max_consecutive_failures
            );
            let terminal = Error::RetriesExhausted {
                attempts: *failures,
                last_error: error.to_string(),
            };
            self.publish(SyncStatus::Failed(terminal.to_string()));
            return Err(terminal);
        }

        let delay = backoff.next_delay();
        warn!(
            reflector = %self.name,
            phase,
            "{} failed (attempt {}/{}): {}, retrying in {:?}",
            phase,
            failures,
            self.config.max_consecutive_failures,
            error,
            delay
        );
        Ok(delay)
    }

    /// List, replace the store, and dispatch the diff. `Ok(None)` means
    /// cancelled.
    async fn relist(&self, token: &CancellationToken) -> Result<Option<String>> {
        let snapshot = tokio::select! {
            biased;
            () = token.cancelled() => return Ok(None),
            snapshot = self.source.snapshot() => snapshot?,
        };

        let resource_version = snapshot.resource_version;
        let changes = self
            .store
            .replace(snapshot.items, resource_version.clone())
            .await?;
        debug!(reflector = %self.name, changes = changes.len(), "dispatching relist diff");

        for change in changes {
            if token.is_cancelled() {
                return Ok(None);
            }
            self.dispatcher.dispatch(change).await;
        }

        self.update_stats(|stats| {
            stats.relists += 1;
            stats.last_sync_resource_version = Some(resource_version.clone());
        });
        Ok(Some(resource_version))
    }

    /// Run one watch session from `checkpoint`, advancing it as events are
    /// applied. Returns how the session ended and how many events it applied.
    async fn watch(
        &self,
        checkpoint: &mut String,
        token: &CancellationToken,
        resync: &mut Option<Interval>,
    ) -> (WatchEnd, u64) {
        let opened = tokio::select! {
            biased;
            () = token.cancelled() => return (WatchEnd::Cancelled, 0),
            opened = self.source.stream(checkpoint.as_str()) => opened,
        };
        let mut stream: EventStream<K> = match opened {
            Ok(stream) => stream,
            Err(e) if e.is_stale() => return (WatchEnd::Stale, 0),
            Err(e) => return (WatchEnd::Failed(e), 0),
        };
        self.update_stats(|stats| stats.watch_sessions += 1);

        let mut applied = 0_u64;
        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => return (WatchEnd::Cancelled, applied),
                () = tick(resync) => {
                    self.resync(token).await;
                    continue;
                }
                next = stream.next() => next,
            };

            match next {
                None => return (WatchEnd::Closed, applied),
                Some(Ok(event)) => match self.apply(event, checkpoint).await {
                    Ok(()) => {
                        applied += 1;
                        self.update_stats(|stats| {
                            stats.events_applied += 1;
                            stats.last_sync_resource_version = Some(checkpoint.clone());
                        });
                    }
                    Err(e) if e.is_stale() => return (WatchEnd::Stale, applied),
                    Err(e) => {
                        warn!(reflector = %self.name, "dropping watch event: {}", e);
                        return (WatchEnd::Failed(e), applied);
                    }
                },
                Some(Err(e)) if e.is_stale() => return (WatchEnd::Stale, applied),
                Some(Err(e)) => {
                    warn!(reflector = %self.name, kind = ?e.kind(), "watch stream error: {}", e);
                    return (WatchEnd::Failed(e), applied);
                }
            }
        }
    }

    /// Apply one event to the store and dispatch the resulting change
    async fn apply(&self, event: WatchEvent<K>, checkpoint: &mut String) -> Result<()> {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                let resource_version = obj.resource_version();
                let change = self.store.upsert(obj).await?;
                debug!(reflector = %self.name, "{:?}", display_change(&change));
                self.dispatcher.dispatch(change).await;
                advance(checkpoint, resource_version);
            }
            WatchEvent::Deleted(obj) => {
                let resource_version = obj.resource_version();
                if self.store.delete(&obj).await?.is_some() {
                    debug!(reflector = %self.name, "🗑️ deleted {}", display_ref(&obj));
                    self.dispatcher.dispatch(Change::Deleted(Arc::new(obj))).await;
                } else {
                    debug!(reflector = %self.name, "delete for unknown {}", display_ref(&obj));
                }
                advance(checkpoint, resource_version);
            }
            WatchEvent::Bookmark(bookmark) => {
                advance(checkpoint, Some(bookmark.metadata.resource_version));
            }
            WatchEvent::Error(response) => return Err(Error::Kube(kube::Error::Api(response))),
        }
        Ok(())
    }

    /// Replay every cached object as an update without touching the store
    async fn resync(&self, token: &CancellationToken) {
        let items = self.store.list().await;
        debug!(reflector = %self.name, items = items.len(), "🔄 resync");
        for obj in items {
            if token.is_cancelled() {
                return;
            }
            self.dispatcher
                .dispatch(Change::Updated {
                    old: Arc::clone(&obj),
                    new: obj,
                })
                .await;
        }
        self.update_stats(|stats| stats.resyncs += 1);
    }

    fn publish(&self, status: SyncStatus) {
        self.status_tx.send_replace(status);
    }

    fn update_stats(&self, f: impl FnOnce(&mut ReflectorStats)) {
        if let Ok(mut stats) = self.stats.write() {
            f(&mut stats);
        }
    }
}

fn advance(checkpoint: &mut String, resource_version: Option<String>) {
    if let Some(rv) = resource_version.filter(|rv| !rv.is_empty()) {
        *checkpoint = rv;
    }
}

fn display_change<K: Resource>(change: &Change<K>) -> String {
    match change {
        Change::Added(obj) => format!("➕ added {}", display_ref(obj.as_ref())),
        Change::Updated { new, .. } => format!("📝 modified {}", display_ref(new.as_ref())),
        Change::Deleted(obj) => format!("🗑️ deleted {}", display_ref(obj.as_ref())),
    }
}

async fn tick(resync: &mut Option<Interval>) {
    match resync {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Sleep for `delay` unless cancelled first; returns false on cancellation
async fn pause(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        () = token.cancelled() => false,
        () = sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_advance_ignores_missing_versions() {
        let mut checkpoint = "10".to_string();
        advance(&mut checkpoint, None);
        assert_eq!(checkpoint, "10");
        advance(&mut checkpoint, Some(String::new()));
        assert_eq!(checkpoint, "10");
        advance(&mut checkpoint, Some("12".to_string()));
        assert_eq!(checkpoint, "12");
    }
}
