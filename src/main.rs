//! Gantry controller binary
//!
//! Wires the registry client, cluster client, reconciler and scheduler
//! together and runs until a shutdown signal or a fatal error.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use gantry::api::{serve_admin, ApiState};
use gantry::broadcast::HttpLoadBalancerConnector;
use gantry::cluster::{create_client, ClusterClientImpl};
use gantry::config::Config;
use gantry::reconciler::ClusterReconciler;
use gantry::registry::HttpRegistry;
use gantry::scheduler::Scheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let config = Config::parse();
    info!(
        registry = %config.registry_url,
        namespace = %config.control_namespace,
        "gantry controller starting"
    );

    let cancel = CancellationToken::new();

    let registry =
        Arc::new(HttpRegistry::new(&config).context("configuring the registry client")?);

    let client = create_client(config.kubeconfig.as_deref())
        .await
        .context("connecting to the cluster")?;
    let cluster = Arc::new(ClusterClientImpl::new(
        client,
        config.control_namespace.as_str(),
    ));

    let connector = Arc::new(
        HttpLoadBalancerConnector::new(&config).context("configuring the load-balancer client")?,
    );

    let reconciler = Arc::new(ClusterReconciler::new(
        cluster,
        registry.clone(),
        connector,
        &config,
    ));
    reconciler
        .check_and_setup()
        .await
        .context("preparing the control namespace")?;

    let scheduler = Arc::new(Scheduler::new(registry.clone(), reconciler.clone(), &config));
    let mut fatal = scheduler.start(&cancel);

    // the scheduler is subscribed before the pump can connect, so the
    // gate-opening storage event cannot arrive on an empty channel
    let event_pump = registry.spawn_event_pump(&cancel);

    let state = ApiState {
        registry: registry.clone(),
        reconciler: reconciler.clone(),
    };
    let mut admin = tokio::spawn(serve_admin(config.listen_addr, state, cancel.clone()));

    let exit = tokio::select! {
        fatal = &mut fatal => match fatal {
            Ok(error) => {
                error!(%error, "fatal error, shutting down");
                Err(error.into())
            }
            // sender dropped during an ordinary shutdown
            Err(_) => Ok(()),
        },
        served = &mut admin => match served {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => {
                error!(%error, "admin surface failed");
                Err(error.into())
            }
            Err(join) => Err(anyhow::Error::new(join).context("admin surface task panicked")),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    };

    cancel.cancel();
    let _ = event_pump.await;

    info!("gantry controller stopped");
    exit
}
