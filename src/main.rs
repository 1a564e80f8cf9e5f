//! sshcontainer daemon entrypoint.
//!
//! Wiring order: configuration → logging → runtime adapter (which also
//! resolves the daemon's own networks) → volume provisioner → registry
//! (with reaper) → SSH front-end. SIGINT/SIGTERM trigger the registry
//! shutdown sweep; in-flight sessions end with their containers.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use sshcontainer::auth::Authenticator;
use sshcontainer::config::Config;
use sshcontainer::registry::{Registry, UserContainers};
use sshcontainer::runtime::{resolve_networks, ContainerRuntime, DockerRuntime};
use sshcontainer::session::SessionBroker;
use sshcontainer::ssh::{self, ServerState};
use sshcontainer::volume::{BtrfsProvisioner, VolumeProvisioner};

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn try_main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_filter().as_str()),
    )
    .init();

    let config = Arc::new(config);
    info!("starting sshcontainer gateway");

    let runtime = DockerRuntime::connect()
        .await
        .context("container runtime is unavailable")?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);

    let networks = resolve_networks(runtime.as_ref(), &config)
        .await
        .context("failed to resolve container networks")?;
    info!("user containers will join networks {networks:?}");

    let volumes: Arc<dyn VolumeProvisioner> =
        Arc::new(BtrfsProvisioner::new(&config, Arc::clone(&runtime)));

    let registry = UserContainers::new(
        Arc::clone(&config),
        Arc::clone(&runtime),
        volumes,
        networks,
    );
    Arc::clone(&registry).spawn_reaper();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let state = Arc::new(ServerState {
        auth: Authenticator::new(&config),
        broker: SessionBroker::new(
            Arc::clone(&registry) as Arc<dyn Registry>,
            Arc::clone(&runtime),
            Arc::clone(&config),
        ),
        config: Arc::clone(&config),
        shutdown: shutdown_rx,
    });

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install signal handler")?;

    let server_result = tokio::select! {
        result = ssh::run_server(state) => Some(result),
        _ = tokio::signal::ctrl_c() => {
            info!("caught interrupt, cleaning up");
            None
        }
        _ = sigterm.recv() => {
            info!("caught SIGTERM, cleaning up");
            None
        }
    };

    let _ = shutdown_tx.send(true);
    registry.shutdown().await;

    server_result.unwrap_or(Ok(()))
}
