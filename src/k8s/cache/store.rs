use crate::error::{Error, Result};
use kube::{Resource, ResourceExt};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Derive the store key of an object: `namespace/name`, or `name` for
/// cluster-scoped objects.
///
/// # Errors
///
/// Returns `Error::InvalidObject` when the object has no name
pub fn object_key<K: Resource>(obj: &K) -> Result<String> {
    let meta = obj.meta();
    let name = meta
        .name
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::InvalidObject("object has no metadata.name".to_string()))?;
    Ok(match meta.namespace.as_deref() {
        Some(ns) if !ns.is_empty() => format!("{ns}/{name}"),
        _ => name.to_string(),
    })
}

/// A single mutation of the store, as seen by observers
pub enum Change<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

impl<K> Change<K> {
    /// The object the change leaves behind (the removed one for deletes)
    #[must_use]
    pub const fn object(&self) -> &Arc<K> {
        match self {
            Self::Added(obj) | Self::Deleted(obj) => obj,
            Self::Updated { new, .. } => new,
        }
    }
}

impl<K> Clone for Change<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Added(obj) => Self::Added(Arc::clone(obj)),
            Self::Updated { old, new } => Self::Updated {
                old: Arc::clone(old),
                new: Arc::clone(new),
            },
            Self::Deleted(obj) => Self::Deleted(Arc::clone(obj)),
        }
    }
}

impl<K: Resource> fmt::Debug for Change<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (label, obj) = match self {
            Self::Added(obj) => ("Added", obj),
            Self::Updated { new, .. } => ("Updated", new),
            Self::Deleted(obj) => ("Deleted", obj),
        };
        write!(
            f,
            "{label}({}@{})",
            obj.meta().name.as_deref().unwrap_or("<unnamed>"),
            obj.meta().resource_version.as_deref().unwrap_or("?")
        )
    }
}

struct StoreState<K> {
    items: BTreeMap<String, Arc<K>>,
    resource_version: Option<String>,
}

/// Thread-safe in-memory mirror of a remote collection.
///
/// All mutations take the write lock once and never hold it across I/O, so
/// readers always observe a state that existed at a single instant.
pub struct Store<K> {
    state: RwLock<StoreState<K>>,
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            state: RwLock::new(StoreState {
                items: BTreeMap::new(),
                resource_version: None,
            }),
        }
    }
}

impl<K> fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl<K: Resource> Store<K> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the object under its key
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidObject` when no key can be derived
    pub async fn upsert(&self, obj: K) -> Result<Change<K>> {
        let key = object_key(&obj)?;
        let new = Arc::new(obj);
        let old = self.state.write().await.items.insert(key, Arc::clone(&new));
        Ok(match old {
            Some(old) => Change::Updated { old, new },
            None => Change::Added(new),
        })
    }

    /// Same as [`Store::upsert`]; a second add of a present key is an update
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidObject` when no key can be derived
    pub async fn add(&self, obj: K) -> Result<Change<K>> {
        self.upsert(obj).await
    }

    /// Same as [`Store::upsert`]; updating an absent key adds it
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidObject` when no key can be derived
    pub async fn update(&self, obj: K) -> Result<Change<K>> {
        self.upsert(obj).await
    }

    /// Remove the entry for the object's key, returning what was stored.
    /// A missing key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidObject` when no key can be derived
    pub async fn delete(&self, obj: &K) -> Result<Option<Arc<K>>> {
        let key = object_key(obj)?;
        Ok(self.delete_by_key(&key).await)
    }

    pub async fn delete_by_key(&self, key: &str) -> Option<Arc<K>> {
        self.state.write().await.items.remove(key)
    }

    /// Look up the stored copy of an object
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidObject` when no key can be derived
    pub async fn get(&self, obj: &K) -> Result<Option<Arc<K>>> {
        let key = object_key(obj)?;
        Ok(self.get_by_key(&key).await)
    }

    pub async fn get_by_key(&self, key: &str) -> Option<Arc<K>> {
        self.state.read().await.items.get(key).cloned()
    }

    /// Snapshot of all objects, ordered by key
    pub async fn list(&self) -> Vec<Arc<K>> {
        self.state.read().await.items.values().cloned().collect()
    }

    /// Snapshot of all keys, sorted
    pub async fn list_keys(&self) -> Vec<String> {
        self.state.read().await.items.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.items.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.items.is_empty()
    }

    /// Resource version recorded by the last [`Store::replace`]
    pub async fn resource_version(&self) -> Option<String> {
        self.state.read().await.resource_version.clone()
    }

    /// Atomically swap the whole contents for `objects`.
    ///
    /// Returns the changes relative to the previous contents: `Added` for
    /// new keys and `Updated` for keys whose resource version moved (in
    /// snapshot order), then `Deleted` for keys the snapshot no longer
    /// contains (in key order). When a key appears more than once, the last
    /// occurrence wins.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidObject` if any object has no key; the store is
    /// left untouched in that case
    #[allow(clippy::significant_drop_tightening)]
    pub async fn replace(&self, objects: Vec<K>, resource_version: String) -> Result<Vec<Change<K>>> {
        let mut order = Vec::with_capacity(objects.len());
        let mut fresh = BTreeMap::new();
        for obj in objects {
            let key = object_key(&obj)?;
            if fresh.insert(key.clone(), Arc::new(obj)).is_none() {
                order.push(key);
            }
        }

        let mut state = self.state.write().await;
        let mut changes = Vec::with_capacity(order.len());
        for key in &order {
            let new = &fresh[key];
            match state.items.get(key) {
                None => changes.push(Change::Added(Arc::clone(new))),
                Some(old) if version_moved(old.as_ref(), new.as_ref()) => {
                    changes.push(Change::Updated {
                        old: Arc::clone(old),
                        new: Arc::clone(new),
                    });
                }
                Some(_) => {}
            }
        }

        let kept: HashSet<&String> = order.iter().collect();
        changes.extend(
            state
                .items
                .iter()
                .filter(|(key, _)| !kept.contains(key))
                .map(|(_, old)| Change::Deleted(Arc::clone(old))),
        );

        debug!(
            items = fresh.len(),
            changes = changes.len(),
            resource_version = %resource_version,
            "store replaced"
        );
        state.items = fresh;
        state.resource_version = Some(resource_version);
        Ok(changes)
    }
}

fn version_moved<K: Resource>(old: &K, new: &K) -> bool {
    match (old.resource_version(), new.resource_version()) {
        (Some(old), Some(new)) => old != new,
        _ => true,
    }
}
