//! Typed Kubernetes resource clients and a watch-driven local cache.
//!
//! [`k8s::resource_client::ResourceClient`] wraps `kube::Api` for one kind,
//! and [`k8s::cache`] keeps an in-memory [`k8s::cache::Store`] in sync with
//! the server through a list/watch [`k8s::cache::Reflector`], fanning changes
//! out to registered handlers.

pub mod error;
pub mod k8s;

pub use error::{Error, ErrorKind, Result};
