use crate::error::{Error, Result};
use crate::k8s::resource_client::{EventStream, ListOptions, ResourceClient};
use async_trait::async_trait;
use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tracing::debug;

/// Full state of a collection at one resource version
#[derive(Debug, Clone)]
pub struct Snapshot<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

/// The list + watch pair a reflector syncs from.
///
/// `stream` ends when the peer closes it; stale-resource-version and
/// transport failures surface either as the open error or as an `Err`
/// item in the stream.
#[async_trait]
pub trait ListerWatcher<K>: Send + Sync {
    async fn snapshot(&self) -> Result<Snapshot<K>>;

    async fn stream(&self, resource_version: &str) -> Result<EventStream<K>>;
}

/// [`ListerWatcher`] backed by a typed client and fixed list options
#[derive(Clone)]
pub struct ListWatch<K> {
    client: ResourceClient<K>,
    options: ListOptions,
}

impl<K> ListWatch<K> {
    pub const fn new(client: ResourceClient<K>, options: ListOptions) -> Self {
        Self { client, options }
    }

    pub const fn options(&self) -> &ListOptions {
        &self.options
    }
}

#[async_trait]
impl<K> ListerWatcher<K> for ListWatch<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    /// Lists every page; the snapshot is consistent at the resource version
    /// of the first page
    async fn snapshot(&self) -> Result<Snapshot<K>> {
        let mut items = Vec::new();
        let mut resource_version = None;
        let mut continue_token: Option<String> = None;
        let mut pages = 0_u32;

        loop {
            let page = self
                .client
                .list_page(&self.options, continue_token.as_deref())
                .await?;
            pages += 1;
            if resource_version.is_none() {
                resource_version = page.metadata.resource_version.clone();
            }
            items.extend(page.items);
            match page.metadata.continue_ {
                Some(token) if !token.is_empty() => continue_token = Some(token),
                _ => break,
            }
        }

        let resource_version = resource_version
            .filter(|rv| !rv.is_empty())
            .ok_or(Error::MissingResourceVersion)?;
        debug!(
            items = items.len(),
            pages,
            resource_version = %resource_version,
            "snapshot listed"
        );
        Ok(Snapshot {
            items,
            resource_version,
        })
    }

    async fn stream(&self, resource_version: &str) -> Result<EventStream<K>> {
        self.client.watch(&self.options, resource_version).await
    }
}
