pub mod config;
pub mod dispatcher;
pub mod informer;
pub mod reflector;
pub mod source;
pub mod store;

pub use config::{BackpressurePolicy, DispatcherConfig, ReflectorConfig};
pub use dispatcher::{
    Dispatcher, DispatcherStats, EventFilter, HandlerId, ResourceEventHandler,
    ResourceEventHandlerFuncs,
};
pub use informer::{Informer, InformerHandle};
pub use reflector::{Backoff, Reflector, ReflectorStats, SyncState, SyncStatus};
pub use source::{ListWatch, ListerWatcher, Snapshot};
pub use store::{Change, Store, object_key};
