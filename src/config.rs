//! Unified configuration for Shipyard.
//!
//! Settings are layered: `.shipyard/shipyard.toml` → environment → CLI.
//! Every field has a default so an absent file yields a working setup.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8742
//!
//! [paths]
//! workspace_root = ".shipyard/projects"
//! infra_root = ".shipyard/infra"
//! deploy_root = ".shipyard/deployments"
//! store_dir = ".shipyard/store"
//!
//! [registry]
//! sweep_interval_secs = 60
//!
//! [registry.sandbox]
//! max_age_secs = 3600
//! max_count = 100
//!
//! [runtime]
//! mode = "auto"            # auto | container | local
//! frontend_ports = [41000, 41999]
//! backend_ports = [42000, 42999]
//! settle_delay_ms = 3000
//!
//! [infra]
//! terraform_bin = "terraform"
//! default_provider = "aws"
//! default_region = "us-east-1"
//!
//! [build]
//! max_fix_rounds = 2
//! fix_command = "./fixer.sh"
//!
//! [deploy]
//! frontend_publish_command = "aws s3 sync {dist} s3://{bucket} --delete"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Which runtime backend the provisioner should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    /// Probe the container daemon once and fall back to local processes.
    #[default]
    Auto,
    Container,
    Local,
}

impl std::str::FromStr for RuntimeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(RuntimeMode::Auto),
            "container" | "docker" => Ok(RuntimeMode::Container),
            "local" | "process" => Ok(RuntimeMode::Local),
            _ => anyhow::bail!(
                "Invalid runtime mode '{}'. Valid values: auto, container, local",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for local UI development.
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8742,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    /// Generated sources live at `<workspace_root>/<project_id>/{frontend,backend}`.
    pub workspace_root: PathBuf,
    /// Terraform state locations live under `<infra_root>/<project_id>/`.
    pub infra_root: PathBuf,
    /// Production-prepared copies live under `<deploy_root>/<project_id>/`.
    pub deploy_root: PathBuf,
    /// JSON project records.
    pub store_dir: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        let base = PathBuf::from(".shipyard");
        Self {
            workspace_root: base.join("projects"),
            infra_root: base.join("infra"),
            deploy_root: base.join("deployments"),
            store_dir: base.join("store"),
        }
    }
}

/// Retention policy for one job registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub max_age_secs: u64,
    pub max_count: usize,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            max_age_secs: 3600,
            max_count: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    pub sweep_interval_secs: u64,
    pub sandbox: RetentionSection,
    pub deployment: RetentionSection,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            sandbox: RetentionSection::default(),
            deployment: RetentionSection {
                max_age_secs: 2 * 3600,
                max_count: 50,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub mode: RuntimeMode,
    /// Inclusive port range for sandbox frontends.
    pub frontend_ports: (u16, u16),
    /// Inclusive port range for sandbox backends. Must not overlap `frontend_ports`.
    pub backend_ports: (u16, u16),
    pub port_attempts: u32,
    pub settle_delay_ms: u64,
    pub health_attempts: u32,
    pub health_interval_ms: u64,
    pub health_timeout_ms: u64,
    pub docker_probe_timeout_ms: u64,
    pub frontend_image: String,
    pub backend_image: String,
    pub frontend_container_command: String,
    pub backend_container_command: String,
    pub python_bin: String,
    pub node_bin: String,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::Auto,
            frontend_ports: (41000, 41999),
            backend_ports: (42000, 42999),
            port_attempts: 10,
            settle_delay_ms: 3000,
            health_attempts: 3,
            health_interval_ms: 1000,
            health_timeout_ms: 5000,
            docker_probe_timeout_ms: 2000,
            frontend_image: "node:20-slim".to_string(),
            backend_image: "node:20-slim".to_string(),
            frontend_container_command:
                "npm install --no-audit --no-fund && npm run dev -- --host 0.0.0.0 --port $PORT"
                    .to_string(),
            backend_container_command: "npm install --no-audit --no-fund && npm start".to_string(),
            python_bin: "python3".to_string(),
            node_bin: "node".to_string(),
        }
    }
}

impl RuntimeSection {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InfraSection {
    pub terraform_bin: String,
    pub timeout_secs: u64,
    /// Provider declared by the destroy placeholder when the state names none.
    pub default_provider: String,
    pub default_region: String,
}

impl Default for InfraSection {
    fn default() -> Self {
        Self {
            terraform_bin: "terraform".to_string(),
            timeout_secs: 30 * 60,
            default_provider: "aws".to_string(),
            default_region: "us-east-1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    pub npm_bin: String,
    pub python_bin: String,
    pub install_timeout_secs: u64,
    pub build_timeout_secs: u64,
    pub max_fix_rounds: u32,
    /// Shell command receiving a JSON fix request on stdin. No fixer when unset.
    pub fix_command: Option<String>,
    pub fix_timeout_secs: u64,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            npm_bin: "npm".to_string(),
            python_bin: "python3".to_string(),
            install_timeout_secs: 10 * 60,
            build_timeout_secs: 10 * 60,
            max_fix_rounds: 2,
            fix_command: None,
            fix_timeout_secs: 5 * 60,
        }
    }
}

impl BuildSection {
    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySection {
    /// Placeholders: `{dist}`, `{bucket}`.
    pub frontend_publish_command: String,
    pub docker_bin: String,
    /// Placeholders: `{image}`, `{cluster}`, `{service}`, `{project}`. Skipped when unset.
    pub backend_release_command: Option<String>,
    pub publish_timeout_secs: u64,
    pub verify_timeout_secs: u64,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            frontend_publish_command: "aws s3 sync {dist} s3://{bucket} --delete".to_string(),
            docker_bin: "docker".to_string(),
            backend_release_command: None,
            publish_timeout_secs: 15 * 60,
            verify_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Directory for daily-rolling log files. Console only when unset.
    pub dir: Option<PathBuf>,
    pub json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShipyardConfig {
    pub server: ServerSection,
    pub paths: PathsSection,
    pub registry: RegistrySection,
    pub runtime: RuntimeSection,
    pub infra: InfraSection,
    pub build: BuildSection,
    pub deploy: DeploySection,
    pub logging: LoggingSection,
}

impl ShipyardConfig {
    /// Default location of the config file relative to a base directory.
    pub fn default_path(base: &Path) -> PathBuf {
        base.join(".shipyard").join("shipyard.toml")
    }

    /// Load from `path`, returning defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: ShipyardConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` and apply environment overrides.
    pub fn load_with_env(path: &Path) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `SHIPYARD_*` overrides read through `lookup`.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("SHIPYARD_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid SHIPYARD_PORT '{}'", port))?;
        }
        if let Some(host) = lookup("SHIPYARD_HOST") {
            self.server.host = host;
        }
        if let Some(root) = lookup("SHIPYARD_WORKSPACE_ROOT") {
            self.paths.workspace_root = PathBuf::from(root);
        }
        if let Some(root) = lookup("SHIPYARD_INFRA_ROOT") {
            self.paths.infra_root = PathBuf::from(root);
        }
        if let Some(bin) = lookup("SHIPYARD_TERRAFORM_BIN") {
            self.infra.terraform_bin = bin;
        }
        if let Some(cmd) = lookup("SHIPYARD_FIX_COMMAND") {
            self.build.fix_command = Some(cmd).filter(|c| !c.trim().is_empty());
        }
        if let Some(mode) = lookup("SHIPYARD_RUNTIME") {
            self.runtime.mode = mode.parse()?;
        }
        Ok(())
    }

    /// Reject settings the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        let (f_lo, f_hi) = self.runtime.frontend_ports;
        let (b_lo, b_hi) = self.runtime.backend_ports;
        if f_lo > f_hi || b_lo > b_hi {
            anyhow::bail!("Port ranges must be ordered as [low, high]");
        }
        if f_lo <= b_hi && b_lo <= f_hi {
            anyhow::bail!(
                "runtime.frontend_ports {:?} overlaps runtime.backend_ports {:?}",
                self.runtime.frontend_ports,
                self.runtime.backend_ports
            );
        }
        if self.registry.sweep_interval_secs == 0 {
            anyhow::bail!("registry.sweep_interval_secs must be greater than zero");
        }
        Ok(())
    }

    /// Directory holding the generated sources of a project.
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.paths.workspace_root.join(project_id)
    }
}
