//! Per-user persistent storage.
//!
//! Each user owns one btrfs subvolume under the shared host mountpoint,
//! capped by a qgroup limit and surfaced to the runtime as a named volume.
//! The subvolume is the source of truth: named volumes are recreated fresh
//! for every container because the local driver caches mount options, but
//! the subvolume and its contents are never deleted here.

mod error;

pub use error::{VolumeError, VolumeResult};

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use tokio::process::Command;

use crate::config::Config;
use crate::runtime::ContainerRuntime;

/// Prefix of the per-user named volumes.
pub const VOLUME_PREFIX: &str = "sshcontainer-vfs-";

/// The runtime volume name for a user.
pub fn volume_name(user: &str) -> String {
    format!("{VOLUME_PREFIX}{user}")
}

/// Validate a username before it is used in filesystem paths or volume
/// names. SSH usernames arrive from the network; anything outside this
/// charset is refused before auth is even attempted.
pub fn validate_username(user: &str) -> VolumeResult<()> {
    if user.is_empty() || user.len() > 64 {
        return Err(VolumeError::InvalidUser(user.to_string()));
    }
    let mut chars = user.chars();
    let first = chars.next().unwrap_or('.');
    if !first.is_ascii_alphanumeric() {
        return Err(VolumeError::InvalidUser(user.to_string()));
    }
    if !user
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(VolumeError::InvalidUser(user.to_string()));
    }
    Ok(())
}

/// Provisions and releases per-user storage. A stateless effectful facade;
/// the registry serializes calls per user.
#[async_trait]
pub trait VolumeProvisioner: Send + Sync {
    /// Create the user's subvolume if missing, re-apply the quota, and
    /// return its host path.
    async fn ensure_subvolume(&self, user: &str) -> VolumeResult<PathBuf>;

    /// Recreate the user's named volume bound to their subvolume and
    /// return its name.
    async fn ensure_named_volume(&self, user: &str) -> VolumeResult<String>;

    /// Remove the user's named volume; the subvolume is left intact.
    async fn release_named_volume(&self, user: &str) -> VolumeResult<()>;
}

/// btrfs-backed implementation operating on the mountpoint and loop device
/// prepared by the bootstrap.
pub struct BtrfsProvisioner {
    mount: PathBuf,
    block_device: String,
    quota: String,
    runtime: Arc<dyn ContainerRuntime>,
}

impl BtrfsProvisioner {
    pub fn new(config: &Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            mount: config.vfs_mount_path.clone(),
            block_device: config.block_device.clone(),
            quota: config.quota.clone(),
            runtime,
        }
    }

    async fn run_btrfs(&self, args: &[&str]) -> VolumeResult<()> {
        let output = Command::new("btrfs")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| VolumeError::CommandFailed {
                command: args.join(" "),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VolumeError::CommandFailed {
                command: args.join(" "),
                message: stderr.trim().to_string(),
            });
        }

        Ok(())
    }

    /// A directory only counts if `btrfs subvolume show` accepts it.
    async fn is_subvolume(&self, path: &str) -> bool {
        Command::new("btrfs")
            .args(["subvolume", "show", path])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl VolumeProvisioner for BtrfsProvisioner {
    async fn ensure_subvolume(&self, user: &str) -> VolumeResult<PathBuf> {
        validate_username(user)?;
        let path = self.mount.join(user);
        let path_str = path.to_string_lossy().to_string();

        match tokio::fs::metadata(&path).await {
            Ok(meta) => {
                if !meta.is_dir() || !self.is_subvolume(&path_str).await {
                    return Err(VolumeError::SubvolumeConflict(path));
                }
                debug!("reusing subvolume {path_str} for {user}");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.run_btrfs(&["subvolume", "create", &path_str]).await?;
                info!("created subvolume {path_str} for {user}");
            }
            Err(e) => return Err(VolumeError::Io(e)),
        }

        // The limit is idempotent and cheap; a quota change in the
        // configuration takes effect on the next acquire.
        self.run_btrfs(&["qgroup", "limit", &self.quota, &path_str])
            .await?;

        Ok(path)
    }

    async fn ensure_named_volume(&self, user: &str) -> VolumeResult<String> {
        validate_username(user)?;
        let name = volume_name(user);
        // Drop any stale volume first: the local driver caches options, and
        // a cached device/subvol pair may no longer match this user.
        self.runtime.remove_volume(&name).await?;
        self.runtime
            .create_volume(&name, &self.block_device, user)
            .await?;
        debug!("created volume {name} on {}", self.block_device);
        Ok(name)
    }

    async fn release_named_volume(&self, user: &str) -> VolumeResult<()> {
        validate_username(user)?;
        self.runtime.remove_volume(&volume_name(user)).await?;
        Ok(())
    }
}
