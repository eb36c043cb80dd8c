// Client creation with custom user-agent support for kube 2.x
use super::USER_AGENT_ENV;
use crate::error::Result;
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};
use tracing::{debug, warn};

/// Resolve the user agent to send: the environment override wins over the
/// caller-provided value.
#[must_use]
pub fn resolve_user_agent(custom_user_agent: Option<&str>) -> Option<String> {
    std::env::var(USER_AGENT_ENV)
        .ok()
        .filter(|ua| !ua.trim().is_empty())
        .or_else(|| custom_user_agent.map(str::to_string))
}

/// Add a user-agent header to the config.
///
/// Invalid header values are logged and skipped; the default kube user
/// agent is used instead.
pub fn add_user_agent_header(config: &mut Config, custom_user_agent: Option<&str>) {
    let Some(user_agent) = resolve_user_agent(custom_user_agent) else {
        return;
    };
    match HeaderValue::from_str(&user_agent) {
        Ok(header_value) => {
            config
                .headers
                .push((HeaderName::from_static("user-agent"), header_value));
        }
        Err(e) => {
            warn!("Ignoring invalid user agent {:?}: {}", user_agent, e);
        }
    }
}

/// Create a new k8s client to interact with k8s cluster api
///
/// # Errors
///
/// Will return `Err` if the kubeconfig can not be inferred or the client
/// can not be built from it
pub async fn new(custom_user_agent: Option<&str>) -> Result<Client> {
    let mut config = Config::infer().await?;
    add_user_agent_header(&mut config, custom_user_agent);
    debug!(cluster_url = %config.cluster_url, "building kube client");

    let client = Client::try_from(config)?;

    Ok(client)
}
