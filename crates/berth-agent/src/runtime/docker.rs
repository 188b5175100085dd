//! [`ContainerRuntime`] backed by the local Docker daemon.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tracing::{debug, info, trace};

use berth_core::ContainerId;

use super::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ExitStatus, ImageInfo, RuntimeError,
};

/// Docker engine client.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connect to the daemon over the default unix socket.
    ///
    /// `timeout` bounds every API request.
    pub fn connect(timeout: Duration) -> Result<Self, RuntimeError> {
        let client = Docker::connect_with_unix_defaults()
            .map_err(|e| RuntimeError::Other(format!("failed to connect to docker: {}", e)))?
            .with_timeout(timeout);
        Ok(Self { client })
    }

    /// Wrap an already configured client.
    pub fn with_client(client: Docker) -> Self {
        Self { client }
    }
}

/// Append `:latest` when the reference names no tag or digest; an untagged
/// pull would otherwise fetch every tag of the repository.
fn qualified_image(image: &str) -> String {
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    if last_segment.contains(':') || last_segment.contains('@') {
        image.to_string()
    } else {
        format!("{}:latest", image)
    }
}

/// Map a daemon error, translating 404s with `not_found`.
fn classify(err: DockerError, not_found: impl FnOnce(String) -> RuntimeError) -> RuntimeError {
    match err {
        DockerError::RequestTimeoutError => RuntimeError::Timeout("docker request".to_string()),
        DockerError::DockerResponseServerError {
            status_code: 404,
            message,
        } => not_found(message),
        DockerError::DockerResponseServerError {
            status_code: 409,
            message,
        } => RuntimeError::Conflict(message),
        DockerError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::Api {
            status: status_code,
            message,
        },
        other => RuntimeError::Other(other.to_string()),
    }
}

fn container_config(spec: &ContainerSpec) -> Config<String> {
    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .ports
        .values()
        .map(|m| (format!("{}/{}", m.internal_port, m.protocol), HashMap::new()))
        .collect();

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
        .ports
        .values()
        .map(|m| {
            (
                format!("{}/{}", m.internal_port, m.protocol),
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(m.external_port.to_string()),
                }]),
            )
        })
        .collect();

    let host_config = HostConfig {
        port_bindings: Some(port_bindings),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.clone()),
        cmd: if spec.command.is_empty() {
            None
        } else {
            Some(spec.command.clone())
        },
        env: Some(spec.env_pairs()),
        exposed_ports: Some(exposed_ports),
        labels: Some(
            spec.labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        ),
        hostname: spec.hostname.clone(),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        let reference = qualified_image(image);
        info!(image = %reference, "Pulling image");

        let mut stream = self.client.create_image(
            Some(CreateImageOptions {
                from_image: reference.clone(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(msg) = stream.next().await {
            let progress = msg.map_err(|e| classify(e, RuntimeError::ImageNotFound))?;
            if let Some(status) = progress.status {
                trace!(image = %reference, status = %status, "Pull progress");
            }
        }

        debug!(image = %reference, "Image pulled");
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInfo, RuntimeError> {
        let reference = qualified_image(image);
        let inspect = self
            .client
            .inspect_image(&reference)
            .await
            .map_err(|e| classify(e, RuntimeError::ImageNotFound))?;

        Ok(ImageInfo {
            id: inspect.id.unwrap_or(reference),
        })
    }

    async fn create_container(
        &self,
        spec: &ContainerSpec,
        name: &str,
    ) -> Result<ContainerId, RuntimeError> {
        let options = Some(CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        });

        let response = self
            .client
            .create_container(options, container_config(spec))
            .await
            .map_err(|e| classify(e, RuntimeError::ImageNotFound))?;

        debug!(container_id = %response.id, name = %name, "Container created");
        Ok(ContainerId::new(response.id))
    }

    async fn start_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.client
            .start_container(id.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| classify(e, RuntimeError::ContainerNotFound))
    }

    async fn inspect_container(&self, id: &ContainerId) -> Result<ContainerInfo, RuntimeError> {
        let inspect = self
            .client
            .inspect_container(id.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, RuntimeError::ContainerNotFound))?;

        let state = inspect.state.unwrap_or_default();
        let ip_address = inspect.network_settings.and_then(|settings| {
            settings
                .ip_address
                .filter(|ip| !ip.is_empty())
                .or_else(|| {
                    settings.networks.and_then(|networks| {
                        networks
                            .into_values()
                            .filter_map(|endpoint| endpoint.ip_address)
                            .find(|ip| !ip.is_empty())
                    })
                })
        });

        Ok(ContainerInfo {
            running: state.running.unwrap_or(false),
            error: state.error.unwrap_or_default(),
            exit_code: state.exit_code,
            ip_address,
        })
    }

    async fn wait_container(&self, id: &ContainerId) -> Result<ExitStatus, RuntimeError> {
        let mut stream = self
            .client
            .wait_container(id.as_str(), None::<WaitContainerOptions<String>>);

        match stream.next().await {
            Some(Ok(response)) => Ok(ExitStatus {
                exit_code: response.status_code,
            }),
            // Non-zero exits are reported as errors by the client.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => {
                Ok(ExitStatus { exit_code: code })
            }
            Some(Err(e)) => Err(classify(e, RuntimeError::ContainerNotFound)),
            None => Err(RuntimeError::Other(format!(
                "wait stream for {} ended without a status",
                id
            ))),
        }
    }

    async fn kill_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        self.client
            .kill_container(id.as_str(), None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| classify(e, RuntimeError::ContainerNotFound))
    }

    async fn remove_container(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.client
            .remove_container(id.as_str(), Some(options))
            .await
            .map_err(|e| classify(e, RuntimeError::ContainerNotFound))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::PortMapping;

    #[test]
    fn test_qualified_image() {
        assert_eq!(qualified_image("busybox"), "busybox:latest");
        assert_eq!(qualified_image("spotify:17"), "spotify:17");
        assert_eq!(
            qualified_image("registry:5000/team/app"),
            "registry:5000/team/app:latest"
        );
        assert_eq!(qualified_image("app@sha256:abc"), "app@sha256:abc");
    }

    #[test]
    fn test_classify_status_codes() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "no such image".to_string(),
        };
        assert!(matches!(
            classify(not_found, RuntimeError::ImageNotFound),
            RuntimeError::ImageNotFound(_)
        ));

        let conflict = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "name in use".to_string(),
        };
        assert!(matches!(
            classify(conflict, RuntimeError::ContainerNotFound),
            RuntimeError::Conflict(_)
        ));

        let timeout = classify(
            DockerError::RequestTimeoutError,
            RuntimeError::ContainerNotFound,
        );
        assert!(timeout.is_transient());
    }

    #[test]
    fn test_container_config_publishes_ports() {
        let mut spec = ContainerSpec {
            image: "spotify:17".to_string(),
            ..Default::default()
        };
        spec.ports
            .insert("default-port".to_string(), PortMapping::of(8080, 20000));

        let config = container_config(&spec);
        let exposed = config.exposed_ports.unwrap();
        assert!(exposed.contains_key("8080/tcp"));

        let bindings = config.host_config.unwrap().port_bindings.unwrap();
        let binding = bindings["8080/tcp"].as_ref().unwrap();
        assert_eq!(binding[0].host_port.as_deref(), Some("20000"));
        assert!(config.cmd.is_none());
    }
}
