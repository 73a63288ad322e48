//! Logs the ConfigMaps of a namespace, on the replica holding the `configmap-controller` Lease
//!
//! Reads `NAMESPACE` and `POD_NAME` from the environment and stops on ctrl-c.
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kooper::{
    runtime::{
        coordination::{LeaderElectionConfig, LeaderElector},
        watcher, CachedHandler, Controller, HandlerError, Informer, Metrics, ResourceHandler,
    },
    Api, Client, Config,
};
use tracing::*;

/// Logs the size of every ConfigMap and notices when one goes away
struct SizeLogger;

#[async_trait]
impl ResourceHandler<ConfigMap> for SizeLogger {
    async fn add(&self, cm: Arc<ConfigMap>) -> Result<(), HandlerError> {
        let name = cm.metadata.name.as_deref().unwrap_or_default();
        let keys = cm.data.as_ref().map_or(0, |data| data.len());
        info!(%name, keys, "configmap present");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), HandlerError> {
        info!(%key, "configmap deleted");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let client = Client::try_default().await?;

    let namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".into());
    let identity = std::env::var("POD_NAME").unwrap_or_else(|_| "configmap-controller-0".into());

    let election = LeaderElectionConfig::builder("configmap-controller", &namespace, &identity, "configmap-controller")
        .finish()?;
    let elector = LeaderElector::spawn(election, client.clone());

    let informer = Informer::watch(
        Api::<ConfigMap>::namespaced(client, &namespace),
        watcher::Config::default(),
    );
    let handler = CachedHandler::new(informer.store(), SizeLogger);
    let metrics = Metrics::new();

    let config = Config::builder("configmap-controller").finish()?;
    let controller = Controller::new(config, informer, handler)
        .with_leadership(elector.state())
        .with_metrics(metrics.clone());

    controller
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    elector.shutdown().await?;

    for (name, outcome, stats) in metrics.snapshot() {
        info!(controller = %name, %outcome, count = stats.count, "handled");
    }
    Ok(())
}
