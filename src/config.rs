//! Environment configuration.
//!
//! Read once at startup; immutable afterwards. Every recognized key has a
//! default except the OAuth2 credentials and the two values only the
//! bootstrap can supply (`CONTAINER_ID`, `BLOCK_DEVICE`).

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use log::LevelFilter;
use thiserror::Error;

use crate::sizeparse::parse_size;

/// Result type for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// A host path bind-mounted into every user container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

/// Immutable daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub ssh_port: u16,
    pub ssh_host_key: PathBuf,
    pub log_level: u8,

    pub oauth_endpoint: String,
    pub client_id: String,
    pub client_secret: String,

    pub image: String,
    pub memory_limit_bytes: i64,
    pub nano_cpus: i64,
    pub network_mode: String,
    pub networks: Vec<String>,
    pub devices: Vec<String>,
    pub cap_add: Vec<String>,
    pub security_opt: Vec<String>,
    pub read_only: bool,

    /// Backing image size; validated here, consumed by the bootstrap.
    pub partition_size: String,
    /// Per-user quota, kept verbatim for `btrfs qgroup limit`.
    pub quota: String,
    /// The same quota in bytes, used to size the per-container /tmp tmpfs.
    pub quota_bytes: u64,

    pub idle_timeout: Duration,
    pub default_cmd: Vec<String>,
    pub container_user: String,
    pub vfs_guest_mount: String,
    pub extra_mounts: Vec<BindMount>,

    pub container_id: String,
    pub block_device: String,
    pub vfs_mount_path: PathBuf,
}

impl Config {
    /// Snapshot the process environment into a validated configuration.
    pub fn from_env() -> ConfigResult<Self> {
        let memory_limit = env_or("DOCKER_MEMORY_LIMIT", "512M");
        let memory_limit_bytes = parse_size(&memory_limit)
            .map_err(|e| invalid("DOCKER_MEMORY_LIMIT", e))
            .and_then(|b| {
                i64::try_from(b).map_err(|_| invalid("DOCKER_MEMORY_LIMIT", "value too large"))
            })?;

        let cpu_limit = env_or("DOCKER_CPU_LIMIT", "1.0");
        let nano_cpus = parse_nano_cpus(&cpu_limit).map_err(|m| invalid("DOCKER_CPU_LIMIT", m))?;

        let quota = env_or("QUOTA", "1G");
        let quota_bytes = parse_size(&quota).map_err(|e| invalid("QUOTA", e))?;

        let partition_size = env_or("PARTITION_SIZE", "20G");
        parse_size(&partition_size).map_err(|e| invalid("PARTITION_SIZE", e))?;

        let idle_secs: u64 = parse_env("CONTAINER_IDLE_TIMEOUT", "60")?;

        let default_cmd = env_list("CONTAINER_CMD");
        let default_cmd = if default_cmd.is_empty() {
            vec!["/bin/bash".to_string()]
        } else {
            default_cmd
        };

        let extra_mounts = env_list("CONTAINER_MOUNTS")
            .iter()
            .map(|entry| parse_mount(entry).map_err(|m| invalid("CONTAINER_MOUNTS", m)))
            .collect::<ConfigResult<Vec<_>>>()?;

        let log_level: u8 = parse_env("LOG_LEVEL", "4")?;
        if log_level > 6 {
            return Err(invalid("LOG_LEVEL", "levels range from 0 (panic) to 6 (trace)"));
        }

        Ok(Self {
            ssh_port: parse_env("SSH_PORT", "2222")?,
            ssh_host_key: PathBuf::from(env_or("SSH_HOST_KEY", "/app/ssh_host_key")),
            log_level,
            oauth_endpoint: env_or("OAUTH_ENDPOINT", "http://proxy:3000"),
            client_id: env_required("CLIENT_ID")?,
            client_secret: env_required("CLIENT_SECRET")?,
            image: env_or("DOCKER_IMAGE", "ubuntu:latest"),
            memory_limit_bytes,
            nano_cpus,
            network_mode: env_or("DOCKER_NETWORK_MODE", "bridge"),
            networks: env_list("DOCKER_NETWORKS"),
            devices: env_list("DOCKER_DEVICES"),
            cap_add: env_list("DOCKER_CAP_ADD"),
            security_opt: env_list("DOCKER_SEC_OPT"),
            read_only: env_bool("DOCKER_READ_ONLY"),
            partition_size,
            quota,
            quota_bytes,
            idle_timeout: Duration::from_secs(idle_secs),
            default_cmd,
            container_user: env_or("CONTAINER_USER", ""),
            vfs_guest_mount: env_or("CONTAINER_VFS_MOUNT", "/workspace"),
            extra_mounts,
            container_id: env_required("CONTAINER_ID")?,
            block_device: env_required("BLOCK_DEVICE")?,
            vfs_mount_path: PathBuf::from(env_or("VFS_MOUNT_PATH", "/mnt/vfs")),
        })
    }

    /// Map the numeric log level onto a `log` filter.
    pub fn log_filter(&self) -> LevelFilter {
        match self.log_level {
            0..=2 => LevelFilter::Error,
            3 => LevelFilter::Warn,
            4 => LevelFilter::Info,
            5 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn invalid(key: &'static str, message: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        key,
        message: message.to_string(),
    }
}

fn env_or(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn env_required(key: &'static str) -> ConfigResult<String> {
    match env::var(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(key)),
    }
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_bool(key: &str) -> bool {
    matches!(
        env::var(key).unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    env_or(key, default)
        .parse()
        .map_err(|e: T::Err| invalid(key, e))
}

/// CPU cores as a float, floored to Docker nano-CPU units.
fn parse_nano_cpus(value: &str) -> Result<i64, String> {
    let cores: f64 = value
        .parse()
        .map_err(|_| format!("not a number: {value}"))?;
    if !cores.is_finite() || cores <= 0.0 {
        return Err(format!("cpu limit must be positive: {value}"));
    }
    let nanos = (cores * 1e9).floor();
    if nanos > i64::MAX as f64 {
        return Err(format!("cpu limit too large: {value}"));
    }
    Ok(nanos as i64)
}

/// Parse a `src:dst[:ro]` mount entry.
fn parse_mount(entry: &str) -> Result<BindMount, String> {
    let parts: Vec<&str> = entry.split(':').collect();
    let (source, target, read_only) = match parts.as_slice() {
        [src, dst] => (src, dst, false),
        [src, dst, "ro"] => (src, dst, true),
        _ => return Err(format!("expected src:dst[:ro], got {entry}")),
    };
    if source.is_empty() || target.is_empty() {
        return Err(format!("empty path in mount entry {entry}"));
    }
    Ok(BindMount {
        source: source.to_string(),
        target: target.to_string(),
        read_only,
    })
}
