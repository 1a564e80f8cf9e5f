//! Docker implementation of the runtime facade, backed by bollard.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config as CreateConfig, CreateContainerOptions, ListContainersOptions, LogOutput,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{
    DeviceMapping, EndpointSettings, HostConfig, Mount, MountTmpfsOptions, MountTypeEnum,
};
use bollard::network::ConnectNetworkOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use futures::StreamExt;
use log::{debug, info, warn};

use super::{
    ContainerRuntime, ContainerSpec, ExecHandle, ExecSpec, OutputChunk, OwnedContainer,
    RuntimeError, RuntimeResult, LABEL_OWNER, LABEL_OWNER_VALUE, LABEL_USER,
};

/// Thin wrapper around one long-lived Docker client handle.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the standard environment (`DOCKER_HOST` or the local
    /// socket) and verify the daemon answers.
    pub async fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;
        Ok(Self { docker })
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn api_error(err: DockerError) -> RuntimeError {
    if is_not_found(&err) {
        RuntimeError::NotFound(err.to_string())
    } else {
        RuntimeError::Api(err.to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        let mut mounts = vec![
            Mount {
                target: Some(spec.volume_target.clone()),
                source: Some(spec.volume_name.clone()),
                typ: Some(MountTypeEnum::VOLUME),
                ..Default::default()
            },
            Mount {
                target: Some("/tmp".to_string()),
                typ: Some(MountTypeEnum::TMPFS),
                tmpfs_options: Some(MountTmpfsOptions {
                    size_bytes: Some(i64::try_from(spec.tmpfs_size_bytes).unwrap_or(i64::MAX)),
                    mode: Some(0o1777),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ];
        for bind in &spec.binds {
            mounts.push(Mount {
                target: Some(bind.target.clone()),
                source: Some(bind.source.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(bind.read_only),
                ..Default::default()
            });
        }

        let devices: Vec<DeviceMapping> = spec
            .devices
            .iter()
            .map(|dev| DeviceMapping {
                path_on_host: Some(dev.clone()),
                path_in_container: Some(dev.clone()),
                cgroup_permissions: Some("rwm".to_string()),
            })
            .collect();

        let host_config = HostConfig {
            network_mode: Some(spec.network_mode.clone()),
            cap_add: Some(spec.cap_add.clone()).filter(|v| !v.is_empty()),
            security_opt: Some(spec.security_opt.clone()).filter(|v| !v.is_empty()),
            readonly_rootfs: Some(spec.read_only_rootfs),
            mounts: Some(mounts),
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.nano_cpus),
            devices: Some(devices).filter(|v| !v.is_empty()),
            ..Default::default()
        };

        let networking_config = spec.primary_network.as_ref().map(|network| NetworkingConfig {
            endpoints_config: HashMap::from([(network.clone(), EndpointSettings::default())]),
        });

        let config = CreateConfig {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()).filter(|v| !v.is_empty()),
            labels: Some(HashMap::from([
                (LABEL_OWNER.to_string(), LABEL_OWNER_VALUE.to_string()),
                (LABEL_USER.to_string(), spec.user.clone()),
            ])),
            open_stdin: Some(spec.open_stdin),
            host_config: Some(host_config),
            networking_config,
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let resp = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RuntimeError::CreateFailed(e.to_string()))?;

        debug!("created container {} for user {}", resp.id, spec.user);
        Ok(resp.id)
    }

    async fn connect_networks(&self, id: &str, networks: &[String]) -> RuntimeResult<()> {
        for network in networks {
            let options = ConnectNetworkOptions {
                container: id.to_string(),
                endpoint_config: EndpointSettings::default(),
            };
            if let Err(e) = self.docker.connect_network(network, options).await {
                warn!("network {network} refused container {id}, removing it: {e}");
                let _ = self.remove(id).await;
                return Err(RuntimeError::NetworkAttachFailed {
                    network: network.clone(),
                    message: e.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn start(&self, id: &str) -> RuntimeResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::StartFailed {
                id: id.to_string(),
                message: e.to_string(),
            })?;
        info!("started container {id}");
        Ok(())
    }

    async fn remove(&self, id: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => {
                info!("removed container {id}");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::Api(e.to_string())),
        }
    }

    async fn list_owned(&self) -> RuntimeResult<Vec<OwnedContainer>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_OWNER}={LABEL_OWNER_VALUE}")],
        );
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(api_error)?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                let id = c.id?;
                let user = c.labels.as_ref().and_then(|l| l.get(LABEL_USER)).cloned();
                Some(OwnedContainer { id, user })
            })
            .collect())
    }

    async fn container_networks(&self, id: &str) -> RuntimeResult<Vec<String>> {
        let resp = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(api_error)?;
        Ok(resp
            .network_settings
            .and_then(|ns| ns.networks)
            .map(|networks| networks.into_keys().collect())
            .unwrap_or_default())
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> RuntimeResult<ExecHandle> {
        let exec_failed = |message: String| RuntimeError::ExecFailed {
            id: id.to_string(),
            message,
        };

        let options = CreateExecOptions::<String> {
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(spec.tty),
            env: Some(spec.env.clone()).filter(|v| !v.is_empty()),
            cmd: Some(spec.cmd.clone()),
            user: Some(spec.user.clone()).filter(|u| !u.is_empty()),
            ..Default::default()
        };

        let created = self
            .docker
            .create_exec(id, options)
            .await
            .map_err(|e| exec_failed(e.to_string()))?;

        let started = self
            .docker
            .start_exec(&created.id, None::<StartExecOptions>)
            .await
            .map_err(|e| exec_failed(e.to_string()))?;

        match started {
            StartExecResults::Attached { output, input } => {
                let output = output.map(|item| match item {
                    Ok(LogOutput::StdErr { message }) => Ok(OutputChunk::Stderr(message)),
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::Console { message })
                    | Ok(LogOutput::StdIn { message }) => Ok(OutputChunk::Stdout(message)),
                    Err(e) => Err(RuntimeError::Api(e.to_string())),
                });
                debug!("opened exec {} in container {id}", created.id);
                Ok(ExecHandle {
                    id: created.id,
                    output: Box::pin(output),
                    input,
                })
            }
            StartExecResults::Detached => {
                Err(exec_failed("exec unexpectedly started detached".to_string()))
            }
        }
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> RuntimeResult<()> {
        self.docker
            .resize_exec(
                exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(api_error)
    }

    async fn create_volume(&self, name: &str, device: &str, subvol: &str) -> RuntimeResult<()> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: "local".to_string(),
            driver_opts: HashMap::from([
                ("type".to_string(), "btrfs".to_string()),
                ("device".to_string(), device.to_string()),
                ("o".to_string(), format!("subvol={subvol}")),
            ]),
            labels: HashMap::from([(LABEL_OWNER.to_string(), LABEL_OWNER_VALUE.to_string())]),
        };
        self.docker
            .create_volume(options)
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Api(e.to_string()))
    }

    async fn remove_volume(&self, name: &str) -> RuntimeResult<()> {
        match self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(RuntimeError::Api(e.to_string())),
        }
    }
}
