//! Container runtime facade.
//!
//! A narrow, policy-free wrapper over the host container runtime. Everything
//! the rest of the daemon needs (create, start, exec with a bidirectional
//! byte stream, resize, remove, label-scoped listing, network and volume
//! management) goes through the [`ContainerRuntime`] trait so tests can
//! substitute a scripted fake. No runtime-specific symbol escapes this
//! module.

mod docker;
mod error;

pub use docker::DockerRuntime;
pub use error::{RuntimeError, RuntimeResult};

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use tokio::io::AsyncWrite;

use crate::config::{BindMount, Config};

/// Label identifying containers owned by this daemon.
pub const LABEL_OWNER: &str = "owner";
/// Value of [`LABEL_OWNER`] on every container we create.
pub const LABEL_OWNER_VALUE: &str = "sshcontainer";
/// Label carrying the owning username.
pub const LABEL_USER: &str = "owner.user";

/// Everything needed to create a user container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Empty means the image default applies.
    pub cmd: Vec<String>,
    pub user: String,
    pub open_stdin: bool,
    pub read_only_rootfs: bool,
    pub memory_bytes: i64,
    pub nano_cpus: i64,
    /// Host devices mapped 1:1 into the guest with `rwm` permissions.
    pub devices: Vec<String>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub network_mode: String,
    /// Endpoint configured at creation; further networks are attached after.
    pub primary_network: Option<String>,
    /// Named volume mounted at `volume_target`.
    pub volume_name: String,
    pub volume_target: String,
    /// Size of the tmpfs mounted on /tmp.
    pub tmpfs_size_bytes: u64,
    pub binds: Vec<BindMount>,
}

/// Parameters for one exec instance.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    /// Guest user to run as; empty means the image default.
    pub user: String,
    pub tty: bool,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
}

/// One chunk of guest output.
///
/// In TTY mode the runtime produces a flat byte stream, surfaced here as
/// `Stdout`. Without a TTY the runtime's stdout/stderr framing is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Bytes),
    Stderr(Bytes),
}

/// A live exec instance: its id plus both stream directions.
///
/// Shutting down the write side signals EOF to the guest process.
pub struct ExecHandle {
    pub id: String,
    pub output: Pin<Box<dyn Stream<Item = RuntimeResult<OutputChunk>> + Send>>,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// A container carrying the ownership label.
#[derive(Debug, Clone)]
pub struct OwnedContainer {
    pub id: String,
    pub user: Option<String>,
}

/// Facade over the container runtime API. Stateless aside from the client
/// handle; all policy lives in the callers.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    /// Attach additional networks. On any failure the container is
    /// force-removed before the error is returned.
    async fn connect_networks(&self, id: &str, networks: &[String]) -> RuntimeResult<()>;

    async fn start(&self, id: &str) -> RuntimeResult<()>;

    /// Force-remove the container together with its anonymous volumes.
    async fn remove(&self, id: &str) -> RuntimeResult<()>;

    /// List all containers (running or not) carrying the ownership label.
    async fn list_owned(&self) -> RuntimeResult<Vec<OwnedContainer>>;

    /// Names of the networks a container is attached to.
    async fn container_networks(&self, id: &str) -> RuntimeResult<Vec<String>>;

    async fn exec(&self, id: &str, spec: &ExecSpec) -> RuntimeResult<ExecHandle>;

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> RuntimeResult<()>;

    /// Create a named local volume binding a btrfs subvolume of `device`.
    async fn create_volume(&self, name: &str, device: &str, subvol: &str) -> RuntimeResult<()>;

    /// Remove a named volume; a missing volume is not an error.
    async fn remove_volume(&self, name: &str) -> RuntimeResult<()>;
}

/// Determine the networks every user container should join: the configured
/// extras plus the daemon's own networks (all of them when it has exactly
/// one, otherwise those suffixed `_default`). The first entry becomes the
/// primary endpoint at creation time.
pub async fn resolve_networks(
    runtime: &dyn ContainerRuntime,
    config: &Config,
) -> RuntimeResult<Vec<String>> {
    let own = runtime.container_networks(&config.container_id).await?;
    if own.is_empty() && config.networks.is_empty() {
        return Err(RuntimeError::Api(format!(
            "daemon container {} has no networks and none are configured",
            config.container_id
        )));
    }

    let mut networks = config.networks.clone();
    for name in &own {
        if (own.len() == 1 || name.ends_with("_default")) && !networks.contains(name) {
            networks.push(name.clone());
        }
    }
    Ok(networks)
}
