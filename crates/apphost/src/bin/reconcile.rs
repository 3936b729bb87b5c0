//! One-shot reconciler entrypoint for the job scheduler:
//! `apphost-reconcile <apply|delete|redeploy|scale> <appid> [replicas]`.
//! Prints the step report as JSON; a non-zero exit tells the scheduler to retry.
use anyhow::{anyhow, bail, Context};
use apphost::{builder::BuildContext, cluster::KubeCluster, config::Settings, ports::PortAllocator, reconciler::Reconciler,
    registry::{SigningIssuer, TokenCache}, store::MemoryStore, telemetry::init_tracing};
use std::sync::Arc;
use tracing::info;

const USAGE: &str = "usage: apphost-reconcile <apply|delete|redeploy|scale> <appid> [replicas]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (op, appid) = match args.as_slice() {
        [op, appid, ..] => (op.as_str(), appid.as_str()),
        _ => bail!(USAGE),
    };
    let settings = Settings::load()?;
    init_tracing(&settings);
    let Some(store_file) = settings.store_file.clone() else { bail!("APPHOST_STORE_FILE must name the record snapshot") };
    let store = Arc::new(MemoryStore::from_snapshot_file(&store_file)?);
    let cluster = KubeCluster::try_default().await?;
    let mut reconciler = Reconciler::new(Arc::new(cluster), store.clone(), BuildContext::from(&settings), Arc::new(PortAllocator::new(settings.node_port_range.clone())));
    if let Some(host) = &settings.registry_host {
        let tokens = TokenCache::new(settings.registry_token_ttl, Box::new(SigningIssuer::new(settings.registry_signing_key.clone())));
        reconciler = reconciler.with_registry(host.clone(), Arc::new(tokens));
    }
    info!(op, appid, "reconcile_start");
    let outcome = match op {
        "apply" => reconciler.apply(appid).await,
        "delete" => reconciler.delete(appid).await,
        "redeploy" => reconciler.redeploy(appid).await,
        "scale" => {
            let n = args.get(2).ok_or_else(|| anyhow!(USAGE))?.parse::<u32>().context("replicas must be a non-negative integer")?;
            reconciler.scale(appid, n).await
        }
        other => bail!("unknown operation {other}; {USAGE}"),
    };
    // State changes are persisted whether or not the operation succeeded.
    store.write_snapshot_file(&store_file)?;
    let report = outcome?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
