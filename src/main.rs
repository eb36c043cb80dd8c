use anyhow::Context;
use clap::Parser;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::ResourceExt;
use kubemirror::k8s::cache::{Informer, ReflectorConfig, ResourceEventHandlerFuncs, SyncStatus};
use kubemirror::k8s::{USER_AGENT, client};
use kubemirror::k8s::resource_client::{ListOptions, ResourceClient};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace to mirror
    #[arg(short, long, default_value = "default")]
    namespace: String,

    /// Label selector, e.g. `app=web,tier!=cache`
    #[arg(short, long)]
    selector: Option<String>,

    /// Field selector, e.g. `metadata.name=settings`
    #[arg(short, long)]
    fields: Option<String>,

    /// Seconds between full resyncs (0 disables)
    #[arg(short, long, default_value_t = 0)]
    resync: u64,

    /// Objects per list page (0 lists everything in one call)
    #[arg(short, long, default_value_t = 0)]
    page_size: u32,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn identity(cm: &ConfigMap) -> String {
    format!(
        "{}@{}",
        cm.name_any(),
        cm.resource_version().unwrap_or_default()
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();
    let client = client::new(Some(USER_AGENT))
        .await
        .context("failed to build kubernetes client")?;

    let mut options = ListOptions::default();
    if let Some(selector) = args.selector.as_deref() {
        options = options.labels(selector);
    }
    if let Some(fields) = args.fields.as_deref() {
        options = options.fields(fields);
    }
    if args.page_size > 0 {
        options = options.page_size(args.page_size);
    }

    let handler = ResourceEventHandlerFuncs::new()
        .add_fn(|cm: &ConfigMap| info!("➕ {}", identity(cm)))
        .update_fn(|old: &ConfigMap, new: &ConfigMap| {
            info!("📝 {} -> {}", identity(old), identity(new));
        })
        .delete_fn(|cm: &ConfigMap| info!("🗑️ {}", identity(cm)));

    let informer = Informer::for_client(ResourceClient::namespaced(client, &args.namespace), options)
        .name(format!("configmaps/{}", args.namespace))
        .reflector_config(ReflectorConfig::default())
        .resync(Duration::from_secs(args.resync))
        .handler(handler)
        .start()
        .await;

    if informer.wait_for_sync().await {
        info!(
            objects = informer.store().len().await,
            resource_version = informer.last_sync_resource_version().unwrap_or_default(),
            "✅ cache synced"
        );
    }

    let mut status = informer.status();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl-C");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if matches!(current, SyncStatus::Failed(_) | SyncStatus::Stopped) {
                    break;
                }
                info!(status = ?current, "sync status");
            }
        }
    }

    let stats = informer.dispatcher_stats().await;
    info!(
        delivered = stats.delivered,
        dropped = stats.dropped,
        "notifications"
    );
    informer.shutdown().await.context("reflector failed")?;
    Ok(())
}
