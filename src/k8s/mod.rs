pub mod cache;
pub mod client;
pub mod resource_client;
pub mod utils;

/// Default user agent for `kubemirror` - automatically uses the package version
///
/// All clients built through `client::new(Some(USER_AGENT))` identify
/// themselves with it. Override with the `KUBEMIRROR_USER_AGENT`
/// environment variable.
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Environment variable consulted before the built-in user agent
pub const USER_AGENT_ENV: &str = "KUBEMIRROR_USER_AGENT";
