#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::serde_json::{self, json};
use kube::ResourceExt;
use kube::api::{ObjectMeta, WatchEvent};
use kube::error::ErrorResponse;
use kubemirror::Error;
use kubemirror::error::Result;
use kubemirror::k8s::cache::{ListerWatcher, ResourceEventHandler, Snapshot};
use kubemirror::k8s::resource_client::EventStream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn cm(name: &str, rv: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            resource_version: Some(rv.to_string()),
            ..ObjectMeta::default()
        },
        ..ConfigMap::default()
    }
}

pub fn snapshot(items: Vec<ConfigMap>, rv: &str) -> Result<Snapshot<ConfigMap>> {
    Ok(Snapshot {
        items,
        resource_version: rv.to_string(),
    })
}

pub fn api_error(code: u16, reason: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{reason} ({code})"),
        reason: reason.to_string(),
        code,
    }))
}

pub fn stale() -> Error {
    api_error(410, "Expired")
}

pub fn bookmark(rv: &str) -> WatchEvent<ConfigMap> {
    serde_json::from_value(json!({
        "type": "BOOKMARK",
        "object": {
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "resourceVersion": rv }
        }
    }))
    .unwrap()
}

/// One scripted watch session
pub enum Session {
    /// Yield the events, then end the stream cleanly
    Close(Vec<Result<WatchEvent<ConfigMap>>>),
    /// Yield the events, then stay open until the watcher goes away
    Hold(Vec<Result<WatchEvent<ConfigMap>>>),
    /// Fail to open the watch at all
    Reject(Error),
}

#[derive(Default)]
struct Script {
    snapshots: Mutex<VecDeque<Result<Snapshot<ConfigMap>>>>,
    sessions: Mutex<VecDeque<Session>>,
    snapshot_calls: AtomicUsize,
    watched_from: Mutex<Vec<String>>,
}

/// In-memory list/watch source that replays a script. Once a script queue
/// is exhausted the corresponding call never returns.
#[derive(Clone, Default)]
pub struct FakeSource {
    script: Arc<Script>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_list(self, result: Result<Snapshot<ConfigMap>>) -> Self {
        self.script.snapshots.lock().unwrap().push_back(result);
        self
    }

    pub fn then_watch(self, session: Session) -> Self {
        self.script.sessions.lock().unwrap().push_back(session);
        self
    }

    pub fn snapshot_calls(&self) -> usize {
        self.script.snapshot_calls.load(Ordering::SeqCst)
    }

    /// Resource versions every watch was opened from, in order
    pub fn watched_from(&self) -> Vec<String> {
        self.script.watched_from.lock().unwrap().clone()
    }
}

#[async_trait]
impl ListerWatcher<ConfigMap> for FakeSource {
    async fn snapshot(&self) -> Result<Snapshot<ConfigMap>> {
        self.script.snapshot_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.snapshots.lock().unwrap().pop_front();
        match next {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }

    async fn stream(&self, resource_version: &str) -> Result<EventStream<ConfigMap>> {
        self.script
            .watched_from
            .lock()
            .unwrap()
            .push(resource_version.to_string());
        let next = self.script.sessions.lock().unwrap().pop_front();
        match next {
            Some(Session::Close(events)) => Ok(stream::iter(events).boxed()),
            Some(Session::Hold(events)) => Ok(stream::iter(events).chain(stream::pending()).boxed()),
            Some(Session::Reject(e)) => Err(e),
            None => Ok(stream::pending().boxed()),
        }
    }
}

/// Handler that records every notification as `add:a@1`,
/// `update:a@1->a@2` or `delete:a@1`
#[derive(Clone, Default)]
pub struct Recorder {
    log: Arc<Mutex<Vec<String>>>,
}

fn identity(obj: &ConfigMap) -> String {
    format!("{}@{}", obj.name_any(), obj.resource_version().unwrap_or_default())
}

impl Recorder {
    pub fn events(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Poll until at least `count` notifications arrived or a second passed
    pub async fn wait_for(&self, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let seen = self.events();
            if seen.len() >= count {
                return seen;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.events()
    }
}

impl ResourceEventHandler<ConfigMap> for Recorder {
    fn on_add(&self, obj: &ConfigMap) {
        self.log.lock().unwrap().push(format!("add:{}", identity(obj)));
    }

    fn on_update(&self, old: &ConfigMap, new: &ConfigMap) {
        self.log
            .lock()
            .unwrap()
            .push(format!("update:{}->{}", identity(old), identity(new)));
    }

    fn on_delete(&self, obj: &ConfigMap) {
        self.log.lock().unwrap().push(format!("delete:{}", identity(obj)));
    }
}
