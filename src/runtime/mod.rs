//! Sandbox runtime provisioning.
//!
//! A [`RuntimeProvisioner`] starts a project's backend and frontend on two
//! random ports, tracks the running instance per owner (a sandbox job id)
//! and probes it over HTTP. The process-vs-container decision is made once
//! at construction: the Docker daemon is pinged and, if unreachable, every
//! instance runs as local processes for the lifetime of the provisioner.

pub mod docker;
pub mod fallback;
pub mod local;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{RuntimeMode, RuntimeSection};
use crate::errors::RuntimeError;

pub use docker::DockerBackend;
pub use local::LocalBackend;

/// Environment variables through which the frontend learns the backend URL.
pub const BACKEND_URL_VARS: &[&str] = &["VITE_API_URL", "REACT_APP_API_URL", "API_URL", "BACKEND_URL"];

const BACKEND_HEALTH_PATHS: &[&str] = &["/health", "/api/health", "/"];
const FRONTEND_HEALTH_PATHS: &[&str] = &["/"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Frontend,
    Backend,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Frontend => "frontend",
            Side::Backend => "backend",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    Container,
    Local,
}

/// Everything a backend needs to start one side.
#[derive(Debug, Clone)]
pub struct SideSpec {
    pub side: Side,
    pub project_id: String,
    /// Source directory of this side, e.g. `<project>/frontend`.
    pub dir: PathBuf,
    /// Directory receiving `<side>.log`.
    pub log_dir: PathBuf,
    pub port: u16,
    pub env: BTreeMap<String, String>,
}

/// Handle to one running side.
pub enum RuntimeHandle {
    Process(tokio::process::Child),
    Container(String), // container ID
    Responder(JoinHandle<()>),
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeHandle::Process(child) => write!(f, "Process({:?})", child.id()),
            RuntimeHandle::Container(id) => write!(f, "Container({})", id),
            RuntimeHandle::Responder(_) => f.write_str("Responder"),
        }
    }
}

#[derive(Debug)]
pub struct StartedSide {
    pub handle: RuntimeHandle,
    pub url: String,
    /// What was launched, e.g. `npm run dev` or `fallback responder`.
    pub entry: String,
}

impl StartedSide {
    pub fn is_fallback(&self) -> bool {
        matches!(self.handle, RuntimeHandle::Responder(_))
    }
}

#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    fn kind(&self) -> RuntimeKind;

    /// Start one side listening on `spec.port`.
    ///
    /// Returns [`RuntimeError::PortInUse`] when the port turned out to be
    /// taken so the caller can retry with another.
    async fn start(&self, spec: &SideSpec) -> Result<StartedSide, RuntimeError>;

    /// Best-effort teardown.
    async fn stop(&self, handle: RuntimeHandle);
}

/// Stop handles that don't need a daemon.
pub(crate) async fn stop_local_handle(handle: RuntimeHandle) {
    match handle {
        RuntimeHandle::Process(mut child) => {
            if let Err(e) = child.kill().await {
                debug!(error = %e, "process already exited");
            }
        }
        RuntimeHandle::Responder(task) => task.abort(),
        RuntimeHandle::Container(id) => {
            warn!(container_id = %id, "container handle passed to local teardown");
        }
    }
}

struct RuntimeInstance {
    view: RuntimeInstanceView,
    frontend: StartedSide,
    backend: StartedSide,
}

/// Serializable description of a running instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInstanceView {
    pub owner: String,
    pub project_id: String,
    pub kind: RuntimeKind,
    pub frontend_url: String,
    pub backend_url: String,
    pub frontend_port: u16,
    pub backend_port: u16,
    pub frontend_entry: String,
    pub backend_entry: String,
    pub frontend_fallback: bool,
    pub backend_fallback: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub backend_healthy: bool,
    pub frontend_healthy: bool,
    /// Endpoint that answered for the backend.
    pub backend_endpoint: Option<String>,
    pub details: Vec<String>,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.backend_healthy && self.frontend_healthy
    }
}

pub struct RuntimeProvisioner {
    backend: Arc<dyn RuntimeBackend>,
    config: RuntimeSection,
    instances: Mutex<HashMap<String, RuntimeInstance>>,
    client: reqwest::Client,
}

impl RuntimeProvisioner {
    /// Pick a backend according to `config.mode`, probing Docker at most once.
    pub async fn detect(config: &RuntimeSection) -> Self {
        let backend: Arc<dyn RuntimeBackend> = match config.mode {
            RuntimeMode::Local => Arc::new(LocalBackend::new(config.clone())),
            RuntimeMode::Container | RuntimeMode::Auto => {
                let probe_timeout = Duration::from_millis(config.docker_probe_timeout_ms);
                match DockerBackend::probe(config.clone(), probe_timeout).await {
                    Some(docker) => {
                        info!("container runtime available, sandboxes run in Docker");
                        Arc::new(docker)
                    }
                    None => {
                        if config.mode == RuntimeMode::Container {
                            warn!("container runtime requested but unreachable, using local processes");
                        } else {
                            info!("container runtime unavailable, sandboxes run as local processes");
                        }
                        Arc::new(LocalBackend::new(config.clone()))
                    }
                }
            }
        };
        Self::with_backend(backend, config.clone())
    }

    pub fn with_backend(backend: Arc<dyn RuntimeBackend>, config: RuntimeSection) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.health_timeout())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            backend,
            config,
            instances: Mutex::new(HashMap::new()),
            client,
        }
    }

    pub fn kind(&self) -> RuntimeKind {
        self.backend.kind()
    }

    pub async fn instance(&self, owner: &str) -> Option<RuntimeInstanceView> {
        self.instances.lock().await.get(owner).map(|i| i.view.clone())
    }

    pub async fn instance_count(&self) -> usize {
        self.instances.lock().await.len()
    }

    fn random_port(&self, range: (u16, u16), exclude: Option<u16>) -> Option<u16> {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let port = rng.gen_range(range.0..=range.1);
            if Some(port) == exclude {
                continue;
            }
            // Skip ports something already listens on.
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
                return Some(port);
            }
        }
        None
    }

    /// Start backend then frontend for `owner`, replacing any instance it
    /// already has.
    pub async fn start_instance(
        &self,
        owner: &str,
        project_dir: &Path,
        project_id: &str,
    ) -> Result<RuntimeInstanceView, RuntimeError> {
        if self.stop_instance(owner).await {
            info!(owner, "replaced previous runtime instance");
        }

        let log_dir = project_dir.join(".sandbox-logs");
        std::fs::create_dir_all(&log_dir)?;

        for attempt in 1..=self.config.port_attempts {
            let Some(backend_port) = self.random_port(self.config.backend_ports, None) else {
                continue;
            };
            let Some(frontend_port) =
                self.random_port(self.config.frontend_ports, Some(backend_port))
            else {
                continue;
            };

            let backend_spec = SideSpec {
                side: Side::Backend,
                project_id: project_id.to_string(),
                dir: project_dir.join("backend"),
                log_dir: log_dir.clone(),
                port: backend_port,
                env: BTreeMap::from([("PORT".to_string(), backend_port.to_string())]),
            };
            let backend = match self.backend.start(&backend_spec).await {
                Ok(started) => started,
                Err(RuntimeError::PortInUse(port)) => {
                    debug!(attempt, port, "backend port taken, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut env = BTreeMap::from([("PORT".to_string(), frontend_port.to_string())]);
            for var in BACKEND_URL_VARS {
                env.insert(var.to_string(), backend.url.clone());
            }
            let frontend_spec = SideSpec {
                side: Side::Frontend,
                project_id: project_id.to_string(),
                dir: project_dir.join("frontend"),
                log_dir: log_dir.clone(),
                port: frontend_port,
                env,
            };
            let frontend = match self.backend.start(&frontend_spec).await {
                Ok(started) => started,
                Err(e) => {
                    self.backend.stop(backend.handle).await;
                    if let RuntimeError::PortInUse(port) = e {
                        debug!(attempt, port, "frontend port taken, retrying");
                        continue;
                    }
                    return Err(e);
                }
            };

            let view = RuntimeInstanceView {
                owner: owner.to_string(),
                project_id: project_id.to_string(),
                kind: self.backend.kind(),
                frontend_url: frontend.url.clone(),
                backend_url: backend.url.clone(),
                frontend_port,
                backend_port,
                frontend_entry: frontend.entry.clone(),
                backend_entry: backend.entry.clone(),
                frontend_fallback: frontend.is_fallback(),
                backend_fallback: backend.is_fallback(),
                started_at: Utc::now(),
            };
            info!(
                owner,
                project_id,
                frontend = %view.frontend_url,
                backend = %view.backend_url,
                "runtime instance started"
            );
            self.instances.lock().await.insert(
                owner.to_string(),
                RuntimeInstance {
                    view: view.clone(),
                    frontend,
                    backend,
                },
            );
            return Ok(view);
        }

        Err(RuntimeError::PortsExhausted {
            attempts: self.config.port_attempts,
        })
    }

    /// Wait the settle delay, then poll both sides a bounded number of times.
    pub async fn health_check(&self, instance: &RuntimeInstanceView) -> HealthReport {
        tokio::time::sleep(self.config.settle_delay()).await;

        let mut report = HealthReport::default();
        let attempts = self.config.health_attempts.max(1);
        for attempt in 1..=attempts {
            let mut details = Vec::new();
            if !report.backend_healthy {
                match self.probe(&instance.backend_url, BACKEND_HEALTH_PATHS).await {
                    Ok(endpoint) => {
                        report.backend_healthy = true;
                        report.backend_endpoint = Some(endpoint);
                    }
                    Err(detail) => details.push(format!("backend: {}", detail)),
                }
            }
            if !report.frontend_healthy {
                match self.probe(&instance.frontend_url, FRONTEND_HEALTH_PATHS).await {
                    Ok(_) => report.frontend_healthy = true,
                    Err(detail) => details.push(format!("frontend: {}", detail)),
                }
            }
            report.details = details;
            if report.healthy() || attempt == attempts {
                break;
            }
            tokio::time::sleep(self.config.health_interval()).await;
        }
        debug!(
            owner = %instance.owner,
            backend = report.backend_healthy,
            frontend = report.frontend_healthy,
            "health check finished"
        );
        report
    }

    /// First path answering 2xx, or a description of the last failure.
    async fn probe(&self, base: &str, paths: &[&str]) -> Result<String, String> {
        let mut last = String::from("no endpoints probed");
        for path in paths {
            let url = format!("{}{}", base.trim_end_matches('/'), path);
            match self.client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(url),
                Ok(resp) => last = format!("{} returned {}", url, resp.status()),
                Err(e) => last = format!("{} unreachable: {}", url, e),
            }
        }
        Err(last)
    }

    /// Tear down the owner's instance. Returns whether one existed.
    pub async fn stop_instance(&self, owner: &str) -> bool {
        let removed = self.instances.lock().await.remove(owner);
        match removed {
            Some(instance) => {
                self.teardown(instance).await;
                info!(owner, "runtime instance stopped");
                true
            }
            None => false,
        }
    }

    async fn teardown(&self, instance: RuntimeInstance) {
        self.backend.stop(instance.frontend.handle).await;
        self.backend.stop(instance.backend.handle).await;
    }

    /// Stop every tracked instance.
    pub async fn shutdown(&self) {
        let drained: Vec<RuntimeInstance> =
            self.instances.lock().await.drain().map(|(_, i)| i).collect();
        if !drained.is_empty() {
            info!(count = drained.len(), "stopping runtime instances");
        }
        futures::future::join_all(drained.into_iter().map(|i| self.teardown(i))).await;
    }
}
