use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use gantry::compute::HttpComputeProvider;
use gantry::config::{Config, Timing};
use gantry::lb::{HttpLoadBalancerApi, LbManager, LoadBalancerApi};
use gantry::orchestrator::{Orchestrator, ProvisionDefaults};
use gantry::ssh::SshRunner;
use gantry::store::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::parse();
    let timing = Timing::default();

    let store = SqliteStore::new(&config.database_url)
        .await
        .context("opening cluster store")?;

    let compute = HttpComputeProvider::new(&config.compute_endpoint);
    let lb_api: Arc<dyn LoadBalancerApi> = Arc::new(HttpLoadBalancerApi::new(&config.lb_endpoint));
    let lb = LbManager::new(lb_api, timing.lb_poll_interval, timing.lb_wait_bound);
    let runner = SshRunner::new(config.host_key_policy()?)
        .with_connect_timeout(timing.ssh_connect_timeout);

    let defaults = ProvisionDefaults {
        image: config.image.clone(),
        flavor: config.flavor.clone(),
        user_data: config.load_user_data()?,
    };

    let orchestrator = Orchestrator::new(
        Arc::new(store),
        Arc::new(compute),
        lb,
        Arc::new(runner),
        timing,
        defaults,
    );

    let app = gantry::api::router(orchestrator);
    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("binding {}", config.listen))?;
    info!(listen = %config.listen, "gantry listening");
    axum::serve(listener, app).await.context("serving")?;
    Ok(())
}
