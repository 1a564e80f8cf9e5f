//! Shared fakes for the registry and broker test suites.
//!
//! The fake runtime records every call and scripts its responses, so the
//! suites can assert on container lifecycle without a Docker daemon; the
//! fake provisioner does the same for storage.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sshcontainer::config::Config;
use sshcontainer::registry::UserContainers;
use sshcontainer::runtime::{
    ContainerRuntime, ContainerSpec, ExecHandle, ExecSpec, OutputChunk, OwnedContainer,
    RuntimeError, RuntimeResult,
};
use sshcontainer::session::{SessionError, SessionSink};
use sshcontainer::volume::{volume_name, VolumeError, VolumeProvisioner, VolumeResult};

pub fn test_config() -> Config {
    Config {
        ssh_port: 2222,
        ssh_host_key: PathBuf::from("/app/ssh_host_key"),
        log_level: 4,
        oauth_endpoint: "http://proxy:3000".to_string(),
        client_id: "gateway".to_string(),
        client_secret: "secret".to_string(),
        image: "ubuntu:latest".to_string(),
        memory_limit_bytes: 512 << 20,
        nano_cpus: 1_000_000_000,
        network_mode: "bridge".to_string(),
        networks: Vec::new(),
        devices: Vec::new(),
        cap_add: Vec::new(),
        security_opt: Vec::new(),
        read_only: false,
        partition_size: "20G".to_string(),
        quota: "1G".to_string(),
        quota_bytes: 1 << 30,
        idle_timeout: Duration::from_secs(60),
        default_cmd: vec!["/bin/bash".to_string()],
        container_user: String::new(),
        vfs_guest_mount: "/workspace".to_string(),
        extra_mounts: Vec::new(),
        container_id: "gateway-self".to_string(),
        block_device: "/dev/loop0".to_string(),
        vfs_mount_path: PathBuf::from("/mnt/vfs"),
    }
}

/// Scripted, call-recording container runtime.
#[derive(Default)]
pub struct FakeRuntime {
    counter: AtomicUsize,
    /// Container ids in creation order.
    pub created: Mutex<Vec<String>>,
    pub started: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    /// Currently existing containers, id → owner.user label.
    pub live: Mutex<HashMap<String, Option<String>>>,
    pub connected: Mutex<Vec<(String, Vec<String>)>>,
    pub exec_specs: Mutex<Vec<ExecSpec>>,
    /// Pre-scripted exec handles, consumed in order.
    pub exec_handles: Mutex<Vec<ExecHandle>>,
    pub resizes: Mutex<Vec<(String, u16, u16)>>,
    pub volumes: Mutex<Vec<String>>,
    pub removed_volumes: Mutex<Vec<String>>,
    pub fail_create: AtomicBool,
    pub fail_start: AtomicBool,
    pub fail_connect: AtomicBool,
}

impl FakeRuntime {
    pub fn push_exec(&self, handle: ExecHandle) {
        self.exec_handles.lock().unwrap().push(handle);
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::CreateFailed("scripted failure".to_string()));
        }
        let id = format!("{}-{}", spec.name, self.counter.fetch_add(1, Ordering::SeqCst));
        self.created.lock().unwrap().push(id.clone());
        self.live
            .lock()
            .unwrap()
            .insert(id.clone(), Some(spec.user.clone()));
        Ok(id)
    }

    async fn connect_networks(&self, id: &str, networks: &[String]) -> RuntimeResult<()> {
        if self.fail_connect.load(Ordering::SeqCst) {
            // The real adapter force-removes the container on attach failure.
            self.live.lock().unwrap().remove(id);
            self.removed.lock().unwrap().push(id.to_string());
            return Err(RuntimeError::NetworkAttachFailed {
                network: networks.first().cloned().unwrap_or_default(),
                message: "scripted failure".to_string(),
            });
        }
        self.connected
            .lock()
            .unwrap()
            .push((id.to_string(), networks.to_vec()));
        Ok(())
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::StartFailed {
                id: id.to_string(),
                message: "scripted failure".to_string(),
            });
        }
        self.started.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        self.live.lock().unwrap().remove(id);
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn list_owned(&self) -> RuntimeResult<Vec<OwnedContainer>> {
        Ok(self
            .live
            .lock()
            .unwrap()
            .iter()
            .map(|(id, user)| OwnedContainer {
                id: id.clone(),
                user: user.clone(),
            })
            .collect())
    }

    async fn container_networks(&self, _id: &str) -> RuntimeResult<Vec<String>> {
        Ok(vec!["gateway_default".to_string()])
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> RuntimeResult<ExecHandle> {
        self.exec_specs.lock().unwrap().push(spec.clone());
        let mut handles = self.exec_handles.lock().unwrap();
        if handles.is_empty() {
            return Err(RuntimeError::ExecFailed {
                id: id.to_string(),
                message: "no scripted exec".to_string(),
            });
        }
        Ok(handles.remove(0))
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> RuntimeResult<()> {
        self.resizes
            .lock()
            .unwrap()
            .push((exec_id.to_string(), rows, cols));
        Ok(())
    }

    async fn create_volume(&self, name: &str, _device: &str, _subvol: &str) -> RuntimeResult<()> {
        self.volumes.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
        self.removed_volumes.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

/// Call-recording volume provisioner.
#[derive(Default)]
pub struct FakeVolumes {
    pub ensured_subvolumes: Mutex<Vec<String>>,
    pub ensured_volumes: Mutex<Vec<String>>,
    pub released: Mutex<Vec<String>>,
    pub fail_subvolume: AtomicBool,
}

#[async_trait]
impl VolumeProvisioner for FakeVolumes {
    async fn ensure_subvolume(&self, user: &str) -> VolumeResult<PathBuf> {
        if self.fail_subvolume.load(Ordering::SeqCst) {
            return Err(VolumeError::SubvolumeConflict(PathBuf::from(format!(
                "/mnt/vfs/{user}"
            ))));
        }
        self.ensured_subvolumes.lock().unwrap().push(user.to_string());
        Ok(PathBuf::from(format!("/mnt/vfs/{user}")))
    }

    async fn ensure_named_volume(&self, user: &str) -> VolumeResult<String> {
        self.ensured_volumes.lock().unwrap().push(user.to_string());
        Ok(volume_name(user))
    }

    async fn release_named_volume(&self, user: &str) -> VolumeResult<()> {
        self.released.lock().unwrap().push(user.to_string());
        Ok(())
    }
}

pub fn make_registry(
    config: Config,
    networks: Vec<String>,
) -> (Arc<UserContainers>, Arc<FakeRuntime>, Arc<FakeVolumes>) {
    let runtime = Arc::new(FakeRuntime::default());
    let volumes = Arc::new(FakeVolumes::default());
    let registry = UserContainers::new(
        Arc::new(config),
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        Arc::clone(&volumes) as Arc<dyn VolumeProvisioner>,
        networks,
    );
    (registry, runtime, volumes)
}

/// Records everything the broker sends towards the SSH client.
#[derive(Debug, Default)]
pub struct SinkState {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit: Option<u32>,
    pub finished: bool,
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    pub state: Arc<Mutex<SinkState>>,
}

#[async_trait]
impl SessionSink for RecordingSink {
    async fn stdout(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.state.lock().unwrap().stdout.extend_from_slice(data);
        Ok(())
    }

    async fn stderr(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.state.lock().unwrap().stderr.extend_from_slice(data);
        Ok(())
    }

    async fn exit(&mut self, code: u32) {
        self.state.lock().unwrap().exit = Some(code);
    }

    async fn finish(&mut self) {
        self.state.lock().unwrap().finished = true;
    }
}

/// An exec handle whose output is a fixed chunk sequence and whose stdin
/// lands in the returned duplex stream.
pub fn scripted_exec(
    id: &str,
    chunks: Vec<RuntimeResult<OutputChunk>>,
) -> (ExecHandle, tokio::io::DuplexStream) {
    let (test_side, guest_side) = tokio::io::duplex(64 * 1024);
    let handle = ExecHandle {
        id: id.to_string(),
        output: Box::pin(futures::stream::iter(chunks)),
        input: Box::pin(guest_side),
    };
    (handle, test_side)
}
