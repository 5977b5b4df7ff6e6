//! Docker runtime backend built on `bollard`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, HostConfig, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    fallback, stop_local_handle, RuntimeBackend, RuntimeHandle, RuntimeKind, Side, SideSpec,
    StartedSide,
};
use crate::config::RuntimeSection;
use crate::errors::RuntimeError;

const PYTHON_IMAGE: &str = "python:3.12-slim";
const PYTHON_COMMAND: &str =
    "pip install --no-cache-dir -r requirements.txt 2>/dev/null; python main.py || python app.py";

pub struct DockerBackend {
    docker: Docker,
    config: RuntimeSection,
}

impl DockerBackend {
    pub fn connect(config: RuntimeSection) -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, config })
    }

    /// Connect and ping within `probe_timeout`; `None` if the daemon isn't there.
    pub async fn probe(config: RuntimeSection, probe_timeout: Duration) -> Option<Self> {
        let backend = match Self::connect(config) {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "docker client unavailable");
                return None;
            }
        };
        match timeout(probe_timeout, backend.docker.ping()).await {
            Ok(Ok(_)) => Some(backend),
            Ok(Err(e)) => {
                debug!(error = %e, "docker ping failed");
                None
            }
            Err(_) => {
                debug!("docker ping timed out");
                None
            }
        }
    }

    fn image_and_command(&self, side: Side, dir: &Path) -> Option<(String, String)> {
        if dir.join("package.json").is_file() {
            let (image, command) = match side {
                Side::Frontend => (
                    &self.config.frontend_image,
                    &self.config.frontend_container_command,
                ),
                Side::Backend => (
                    &self.config.backend_image,
                    &self.config.backend_container_command,
                ),
            };
            return Some((image.clone(), command.clone()));
        }
        if dir.join("requirements.txt").is_file() || dir.join("main.py").is_file() {
            return Some((PYTHON_IMAGE.to_string(), PYTHON_COMMAND.to_string()));
        }
        None
    }

    fn container_config(
        &self,
        spec: &SideSpec,
        image: String,
        command: String,
        source: &Path,
    ) -> ContainerCreateBody {
        let mut env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        env.push("HOST=0.0.0.0".to_string());

        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            format!("{}/tcp", spec.port),
            Some(vec![PortBinding {
                host_ip: Some("127.0.0.1".to_string()),
                host_port: Some(spec.port.to_string()),
            }]),
        );

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: Some(vec![format!("{}:/app", source.display())]),
            ..Default::default()
        };

        ContainerCreateBody {
            image: Some(image),
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command]),
            env: Some(env),
            working_dir: Some("/app".to_string()),
            host_config: Some(host_config),
            ..Default::default()
        }
    }

    async fn remove(&self, container_id: &str) {
        let remove_options = Some(RemoveContainerOptions {
            force: true,
            ..Default::default()
        });
        if let Err(e) = self.docker.remove_container(container_id, remove_options).await {
            warn!(container_id, error = %e, "failed to remove container");
        }
    }
}

fn is_port_conflict(err: &bollard::errors::Error) -> bool {
    let message = err.to_string();
    message.contains("port is already allocated") || message.contains("address already in use")
}

#[async_trait]
impl RuntimeBackend for DockerBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Container
    }

    async fn start(&self, spec: &SideSpec) -> Result<StartedSide, RuntimeError> {
        let url = format!("http://127.0.0.1:{}", spec.port);
        let Some((image, command)) = self.image_and_command(spec.side, &spec.dir) else {
            info!(side = %spec.side, project_id = %spec.project_id, "no manifest, starting fallback responder");
            let handle = fallback::spawn_responder(spec.side, &spec.dir, spec.port).await?;
            return Ok(StartedSide {
                handle: RuntimeHandle::Responder(handle),
                url,
                entry: "fallback responder".to_string(),
            });
        };

        let source = spec.dir.canonicalize()?;
        let short = Uuid::new_v4().simple().to_string();
        let name = format!("shipyard-{}-{}-{}", spec.project_id, spec.side, &short[..8]);
        let entry = format!("{} ({})", image, command);
        let body = self.container_config(spec, image, command, &source);

        let create_options = Some(CreateContainerOptions {
            name: Some(name.clone()),
            platform: String::new(),
        });
        let container = self.docker.create_container(create_options, body).await?;

        if let Err(e) = self
            .docker
            .start_container(&container.id, None::<StartContainerOptions>)
            .await
        {
            self.remove(&container.id).await;
            if is_port_conflict(&e) {
                return Err(RuntimeError::PortInUse(spec.port));
            }
            return Err(e.into());
        }

        info!(
            side = %spec.side,
            container = %name,
            container_id = %&container.id[..12.min(container.id.len())],
            port = spec.port,
            "container started"
        );
        Ok(StartedSide {
            handle: RuntimeHandle::Container(container.id),
            url,
            entry,
        })
    }

    async fn stop(&self, handle: RuntimeHandle) {
        match handle {
            RuntimeHandle::Container(id) => {
                let stop_options = Some(StopContainerOptions {
                    t: Some(5),
                    ..Default::default()
                });
                if let Err(e) = self.docker.stop_container(&id, stop_options).await {
                    debug!(container_id = %id, error = %e, "stop failed, forcing removal");
                }
                self.remove(&id).await;
            }
            other => stop_local_handle(other).await,
        }
    }
}
