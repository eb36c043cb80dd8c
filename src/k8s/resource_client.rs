/**
 * Typed resource client
 *
 * One client per resource kind, bound to a namespace (or to all
 * namespaces / cluster scope). Errors from the API server are passed
 * through untouched; retrying is the reflector's job.
 */
use super::cache::config::WATCH_TIMEOUT_SECONDS;
use super::utils::format_label_selector;
use crate::error::{Error, Result};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::serde_json;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{
    Api, DeleteParams, ListParams, ObjectList, Patch, PatchParams, PostParams, WatchEvent,
    WatchParams,
};
use kube::{Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

/// A restartable stream of change events, keyed to resource versions.
pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Caller-supplied selectors and limits passed through to list and watch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Server-side timeout for list and watch calls
    pub timeout_secs: Option<u32>,
    /// Page size for list calls; `None` lists everything in one response
    pub page_size: Option<u32>,
}

impl ListOptions {
    #[must_use]
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    #[must_use]
    pub fn label_map(self, labels: &BTreeMap<String, String>) -> Self {
        if labels.is_empty() {
            return self;
        }
        self.labels(&format_label_selector(labels))
    }

    #[must_use]
    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }

    #[must_use]
    pub const fn timeout(mut self, seconds: u32) -> Self {
        self.timeout_secs = Some(seconds);
        self
    }

    #[must_use]
    pub const fn page_size(mut self, limit: u32) -> Self {
        self.page_size = Some(limit);
        self
    }

    pub(crate) fn list_params(&self, continue_token: Option<&str>) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(labels) = &self.label_selector {
            lp = lp.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            lp = lp.fields(fields);
        }
        if let Some(timeout) = self.timeout_secs {
            lp = lp.timeout(timeout);
        }
        if let Some(limit) = self.page_size {
            lp = lp.limit(limit);
        }
        if let Some(token) = continue_token {
            lp = lp.continue_token(token);
        }
        lp
    }

    pub(crate) fn watch_params(&self) -> WatchParams {
        // the API server rejects watch timeouts of 295s and above
        let timeout = self
            .timeout_secs
            .unwrap_or(WATCH_TIMEOUT_SECONDS)
            .min(WATCH_TIMEOUT_SECONDS);
        let mut wp = WatchParams::default().timeout(timeout);
        if let Some(labels) = &self.label_selector {
            wp = wp.labels(labels);
        }
        if let Some(fields) = &self.field_selector {
            wp = wp.fields(fields);
        }
        wp
    }
}

/// Typed client for one resource kind
#[derive(Clone)]
pub struct ResourceClient<K> {
    api: Api<K>,
    namespace: Option<String>,
}

impl<K> ResourceClient<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    /// Client for a namespaced kind within `namespace`
    pub fn namespaced(client: Client, namespace: &str) -> Self
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: Some(namespace.to_string()),
        }
    }

    /// Client for a cluster-scoped kind, or a namespaced kind across all namespaces
    pub fn all(client: Client) -> Self
    where
        <K as Resource>::DynamicType: Default,
    {
        Self {
            api: Api::all(client),
            namespace: None,
        }
    }

    /// Wrap an existing `Api`, e.g. one built for a dynamic type
    pub const fn from_api(api: Api<K>, namespace: Option<String>) -> Self {
        Self { api, namespace }
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    /// Fetch a single object by name
    ///
    /// # Errors
    ///
    /// Returns the server error unchanged, `ErrorKind::NotFound` when the
    /// object does not exist
    pub async fn get(&self, name: &str) -> Result<K> {
        debug!(name, ns = ?self.namespace, "get");
        Ok(self.api.get(name).await?)
    }

    /// Fetch a single object by name, mapping not-found to `None`
    ///
    /// # Errors
    ///
    /// Returns any server error other than not-found
    pub async fn get_opt(&self, name: &str) -> Result<Option<K>> {
        Ok(self.api.get_opt(name).await?)
    }

    /// List objects matching `options` in one response (or the first page
    /// when a page size is set)
    ///
    /// # Errors
    ///
    /// Returns the server error unchanged
    pub async fn list(&self, options: &ListOptions) -> Result<ObjectList<K>> {
        self.list_page(options, None).await
    }

    /// List one page, continuing from `continue_token`
    ///
    /// # Errors
    ///
    /// Returns the server error unchanged; an expired continue token
    /// surfaces as `ErrorKind::StaleResourceVersion`
    pub async fn list_page(
        &self,
        options: &ListOptions,
        continue_token: Option<&str>,
    ) -> Result<ObjectList<K>> {
        let lp = options.list_params(continue_token);
        let list = self.api.list(&lp).await?;
        debug!(
            items = list.items.len(),
            resource_version = ?list.metadata.resource_version,
            "list page"
        );
        Ok(list)
    }

    /// Open a watch from `resource_version`
    ///
    /// # Errors
    ///
    /// Returns the error if the watch request can not be established
    pub async fn watch(
        &self,
        options: &ListOptions,
        resource_version: &str,
    ) -> Result<EventStream<K>> {
        let wp = options.watch_params();
        debug!(resource_version, ns = ?self.namespace, "opening watch");
        let stream = self.api.watch(&wp, resource_version).await?;
        Ok(stream.map_err(Error::from).boxed())
    }

    /// Create an object; returns the server's representation
    ///
    /// # Errors
    ///
    /// Returns the server error unchanged (`Conflict` when it already exists)
    pub async fn create(&self, obj: &K) -> Result<K> {
        Ok(self.api.create(&PostParams::default(), obj).await?)
    }

    /// Replace an object by its own name; returns the server's representation
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidObject` when the object has no name, otherwise
    /// the server error unchanged (`Conflict` on a stale resource version)
    pub async fn update(&self, obj: &K) -> Result<K> {
        let name = required_name(obj)?;
        Ok(self.api.replace(&name, &PostParams::default(), obj).await?)
    }

    /// Replace the object's status through the status subresource
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidObject` when the object has no name, otherwise
    /// the server error unchanged
    pub async fn update_status(&self, obj: &K) -> Result<K> {
        let name = required_name(obj)?;
        let data = serde_json::to_vec(obj)?;
        Ok(self
            .api
            .replace_status(&name, &PostParams::default(), data)
            .await?)
    }

    /// Delete an object by name
    ///
    /// Returns the object when deletion is still in progress (finalizers
    /// pending) and `None` when the server reports it gone.
    ///
    /// # Errors
    ///
    /// Returns the server error unchanged (`NotFound` when it does not exist)
    pub async fn delete(&self, name: &str, params: &DeleteParams) -> Result<Option<K>> {
        Ok(self.api.delete(name, params).await?.left())
    }

    /// Delete every object matching `options`
    ///
    /// # Errors
    ///
    /// Returns the server error unchanged
    pub async fn delete_collection(
        &self,
        params: &DeleteParams,
        options: &ListOptions,
    ) -> Result<()> {
        let lp = options.list_params(None);
        self.api.delete_collection(params, &lp).await?;
        Ok(())
    }

    /// Apply a patch and return the patched object
    ///
    /// # Errors
    ///
    /// Returns the server error unchanged
    pub async fn patch<P: Serialize + Debug>(
        &self,
        name: &str,
        params: &PatchParams,
        patch: &Patch<P>,
    ) -> Result<K> {
        Ok(self.api.patch(name, params, patch).await?)
    }

    /// Patch a subresource such as `status` or `scale`
    ///
    /// # Errors
    ///
    /// Returns the server error unchanged
    pub async fn patch_subresource<P: Serialize + Debug>(
        &self,
        subresource: &str,
        name: &str,
        params: &PatchParams,
        patch: &Patch<P>,
    ) -> Result<K> {
        debug!(subresource, name, "patch subresource");
        Ok(self
            .api
            .patch_subresource(subresource, name, params, patch)
            .await?)
    }
}

fn required_name<K: Resource>(obj: &K) -> Result<String> {
    obj.meta()
        .name
        .clone()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| Error::InvalidObject("object has no metadata.name".to_string()))
}

/// Name and namespace of an object for log lines
pub(crate) fn display_ref<K: Resource>(obj: &K) -> String {
    match obj.namespace() {
        Some(ns) => format!("{ns}/{}", obj.name_any()),
        None => obj.name_any(),
    }
}
