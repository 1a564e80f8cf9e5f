//! Username → live container mapping.
//!
//! The registry is the sole owner of container lifecycle: sessions acquire
//! and release handles, a background reaper removes containers whose stream
//! count has been zero for longer than the idle timeout, and shutdown
//! sweeps everything carrying the ownership label.
//!
//! Lock order is registry RwLock → per-entry Mutex, and neither is held
//! while talking to the runtime except during first-contact creation, where
//! the write lock deliberately serializes concurrent sessions for the same
//! new user.

mod error;

pub use error::{RegistryError, RegistryResult};

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::runtime::{ContainerRuntime, ContainerSpec};
use crate::volume::{volume_name, VolumeProvisioner};

/// How often the reaper scans for idle containers.
pub const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// Handle lifecycle operations the broker and daemon need. The in-memory
/// implementation and a test fake are interchangeable behind this trait.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Return the user's container id, creating and starting the container
    /// (and its storage) on first contact. Increments the active-stream
    /// count and bumps last-used.
    async fn acquire(&self, user: &str) -> RegistryResult<String>;

    /// Decrement the user's active-stream count (floored at zero) and bump
    /// last-used. Never removes the entry; that is the reaper's job.
    async fn release(&self, user: &str);

    /// Remove every container that has been idle longer than the timeout.
    /// Returns how many were reaped.
    async fn reap_once(&self, now: Instant) -> usize;

    /// Stop the reaper and remove every container carrying the ownership
    /// label, registered or not.
    async fn shutdown(&self);
}

struct EntryState {
    refcount: u64,
    last_used: Instant,
}

/// One live container and its session bookkeeping.
struct UserContainer {
    id: String,
    user: String,
    state: Mutex<EntryState>,
}

/// In-memory registry over the container runtime and volume provisioner.
pub struct UserContainers {
    entries: RwLock<HashMap<String, Arc<UserContainer>>>,
    runtime: Arc<dyn ContainerRuntime>,
    volumes: Arc<dyn VolumeProvisioner>,
    config: Arc<Config>,
    /// Resolved network list; the first entry is the primary endpoint.
    networks: Vec<String>,
    reaper: StdMutex<Option<JoinHandle<()>>>,
}

impl UserContainers {
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn ContainerRuntime>,
        volumes: Arc<dyn VolumeProvisioner>,
        networks: Vec<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            runtime,
            volumes,
            config,
            networks,
            reaper: StdMutex::new(None),
        })
    }

    /// Start the periodic reaper. Call once after construction.
    pub fn spawn_reaper(self: Arc<Self>) {
        let registry = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REAP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.reap_once(Instant::now()).await;
            }
        });
        *self.reaper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Current active-stream count for a user, if a container exists.
    pub async fn active_streams(&self, user: &str) -> Option<u64> {
        let entries = self.entries.read().await;
        let entry = entries.get(user)?;
        let refcount = entry.state.lock().await.refcount;
        Some(refcount)
    }

    fn container_spec(&self, user: &str) -> ContainerSpec {
        let config = &self.config;
        ContainerSpec {
            name: format!("sshcontainer-{user}"),
            image: config.image.clone(),
            // No command: the image default runs; sessions attach their
            // own exec instances.
            cmd: Vec::new(),
            user: user.to_string(),
            open_stdin: true,
            read_only_rootfs: config.read_only,
            memory_bytes: config.memory_limit_bytes,
            nano_cpus: config.nano_cpus,
            devices: config.devices.clone(),
            cap_add: config.cap_add.clone(),
            security_opt: config.security_opt.clone(),
            network_mode: config.network_mode.clone(),
            primary_network: self.networks.first().cloned(),
            volume_name: volume_name(user),
            volume_target: config.vfs_guest_mount.clone(),
            tmpfs_size_bytes: config.quota_bytes,
            binds: config.extra_mounts.clone(),
        }
    }

    /// Provision storage, create, wire and start a container for a new
    /// user. Runs under the registry write lock; partial side effects are
    /// rolled back best-effort, and the subvolume is always left intact.
    async fn create_container(&self, user: &str) -> RegistryResult<String> {
        self.volumes.ensure_subvolume(user).await?;
        self.volumes.ensure_named_volume(user).await?;

        let spec = self.container_spec(user);
        let id = self.runtime.create(&spec).await?;

        if self.networks.len() > 1 {
            // The adapter force-removes the container on attach failure.
            if let Err(e) = self.runtime.connect_networks(&id, &self.networks[1..]).await {
                let _ = self.volumes.release_named_volume(user).await;
                return Err(e.into());
            }
        }

        if let Err(e) = self.runtime.start(&id).await {
            let _ = self.runtime.remove(&id).await;
            let _ = self.volumes.release_named_volume(user).await;
            return Err(e.into());
        }

        info!("created container {id} for user {user}");
        Ok(id)
    }
}

#[async_trait]
impl Registry for UserContainers {
    async fn acquire(&self, user: &str) -> RegistryResult<String> {
        {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(user) {
                let mut state = entry.state.lock().await;
                state.refcount += 1;
                state.last_used = Instant::now();
                debug!(
                    "user {user} attached to container {} ({} streams)",
                    entry.id, state.refcount
                );
                return Ok(entry.id.clone());
            }
        }

        let mut entries = self.entries.write().await;
        // A concurrent first contact may have created the entry while we
        // waited for the write lock.
        if let Some(entry) = entries.get(user) {
            let mut state = entry.state.lock().await;
            state.refcount += 1;
            state.last_used = Instant::now();
            return Ok(entry.id.clone());
        }

        let id = self.create_container(user).await?;
        entries.insert(
            user.to_string(),
            Arc::new(UserContainer {
                id: id.clone(),
                user: user.to_string(),
                state: Mutex::new(EntryState {
                    refcount: 1,
                    last_used: Instant::now(),
                }),
            }),
        );
        Ok(id)
    }

    async fn release(&self, user: &str) {
        let entries = self.entries.read().await;
        if let Some(entry) = entries.get(user) {
            let mut state = entry.state.lock().await;
            if state.refcount > 0 {
                state.refcount -= 1;
            }
            state.last_used = Instant::now();
            debug!(
                "user {user} detached from container {} ({} streams left)",
                entry.id, state.refcount
            );
        }
    }

    async fn reap_once(&self, now: Instant) -> usize {
        let victims: Vec<Arc<UserContainer>> = {
            let mut entries = self.entries.write().await;
            let mut idle = Vec::new();
            for (user, entry) in entries.iter() {
                let state = entry.state.lock().await;
                if state.refcount == 0
                    && now.saturating_duration_since(state.last_used) > self.config.idle_timeout
                {
                    idle.push(user.clone());
                }
            }
            idle.iter()
                .filter_map(|user| entries.remove(user))
                .collect()
        };

        let mut reaped = 0;
        for entry in victims {
            // Removal is idempotent at the runtime level; a failure here is
            // logged and the shutdown sweep remains the backstop.
            if let Err(e) = self.runtime.remove(&entry.id).await {
                warn!("failed to reap idle container {}: {e}", entry.id);
            }
            if let Err(e) = self.volumes.release_named_volume(&entry.user).await {
                warn!("failed to release volume for {}: {e}", entry.user);
            }
            info!("reaped idle container {} of user {}", entry.id, entry.user);
            reaped += 1;
        }
        reaped
    }

    async fn shutdown(&self) {
        if let Some(handle) = self.reaper.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }

        // Sweep by label rather than by registry content so containers
        // surviving a daemon restart are removed too.
        match self.runtime.list_owned().await {
            Ok(containers) => {
                for container in containers {
                    if let Err(e) = self.runtime.remove(&container.id).await {
                        error!("failed to remove container {}: {e}", container.id);
                    }
                    if let Some(user) = container.user {
                        if let Err(e) = self.volumes.release_named_volume(&user).await {
                            warn!("failed to release volume for {user}: {e}");
                        }
                    }
                }
            }
            Err(e) => error!("failed to list owned containers: {e}"),
        }

        self.entries.write().await.clear();
        info!("registry shut down");
    }
}
