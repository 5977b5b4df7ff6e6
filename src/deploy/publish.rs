//! Application publish: frontend build and upload, backend image and release.
//!
//! Every step is best-effort. A failed step is logged as a warning and the
//! remaining steps still run.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::prep::{PreparedProject, write_env_production};
use crate::config::ShipyardConfig;
use crate::infra::ProvisionedResources;
use crate::process::{CommandSpec, tail};
use crate::runtime::Side;
use crate::sandbox::toolchain::{self, IGNORED_DIRS, Toolchain};

const FRONTEND_URL_VARS: &[&str] = &["VITE_API_URL", "REACT_APP_API_URL"];

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReport {
    pub frontend_built: bool,
    pub frontend_published: bool,
    pub backend_image: Option<String>,
    pub backend_released: bool,
    pub logs: Vec<String>,
    pub warnings: Vec<String>,
}

impl PublishReport {
    fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!("{}", line);
        self.logs.push(line);
    }

    fn warn(&mut self, line: impl Into<String>) {
        let line = line.into();
        warn!("{}", line);
        self.logs.push(format!("WARNING: {}", line));
        self.warnings.push(line);
    }
}

/// Substitute `{name}` placeholders.
pub fn render_template(template: &str, vars: &BTreeMap<&str, String>) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{}}}", name), value)
    })
}

/// Build and ship both sides of a prepared project.
pub async fn publish(
    prepared: &PreparedProject,
    resources: &ProvisionedResources,
    config: &ShipyardConfig,
    project_id: &str,
) -> PublishReport {
    let mut report = PublishReport::default();

    if let Some(backend_url) = &resources.backend_url {
        let vars: BTreeMap<String, String> = FRONTEND_URL_VARS
            .iter()
            .map(|k| (k.to_string(), backend_url.clone()))
            .collect();
        match write_env_production(&prepared.frontend_dir, &vars) {
            Ok(()) => report.log(format!("Frontend API URL set to {}", backend_url)),
            Err(e) => report.warn(format!("Could not write frontend .env.production: {:#}", e)),
        }
    }

    let dist = prepared.frontend_dir.join("dist");
    report.frontend_built = build_frontend(&prepared.frontend_dir, &dist, config, &mut report).await;

    if report.frontend_built {
        match resources.frontend_bucket() {
            Some(bucket) => {
                let vars = BTreeMap::from([
                    ("dist", dist.display().to_string()),
                    ("bucket", bucket),
                ]);
                let command = render_template(&config.deploy.frontend_publish_command, &vars);
                report.frontend_published =
                    run_shell(&command, &prepared.frontend_dir, config, &mut report).await;
            }
            None => report.log("No frontend storage output; skipping frontend publish"),
        }
    }

    match resources.backend_repository() {
        Some(repository) => {
            let image = format!("{}:{}", repository, Utc::now().format("%Y%m%d%H%M%S"));
            if build_and_push(&image, &prepared.backend_dir, config, &mut report).await {
                report.backend_image = Some(image);
            }
        }
        None => report.log("No container registry output; skipping backend image"),
    }

    if let Some(template) = &config.deploy.backend_release_command {
        let vars = BTreeMap::from([
            ("image", report.backend_image.clone().unwrap_or_default()),
            ("cluster", resources.cluster_name().unwrap_or_default()),
            ("service", resources.service_name().unwrap_or_default()),
            ("project", project_id.to_string()),
        ]);
        let command = render_template(template, &vars);
        report.backend_released = run_shell(&command, &prepared.backend_dir, config, &mut report).await;
    }

    report
}

async fn build_frontend(
    dir: &Path,
    dist: &Path,
    config: &ShipyardConfig,
    report: &mut PublishReport,
) -> bool {
    match Toolchain::detect(dir) {
        Toolchain::Node => {
            let install = toolchain::install(Side::Frontend, dir, &config.build).await;
            if !install.success {
                report.warn(format!("Frontend install failed: {}", install.output));
                return false;
            }
            let build = toolchain::build(Side::Frontend, dir, &config.build).await;
            if !build.success {
                report.warn(format!("Frontend build failed: {}", build.output));
                return false;
            }
            if !dist.is_dir() {
                report.warn("Frontend build produced no dist/ directory");
                return false;
            }
            report.log(format!("Frontend built in {}ms", build.duration_ms));
            true
        }
        Toolchain::Static => {
            match copy_static(dir, dist) {
                Ok(count) => {
                    report.log(format!("Copied {} static files into dist/", count));
                    true
                }
                Err(e) => {
                    report.warn(format!("Static frontend copy failed: {:#}", e));
                    false
                }
            }
        }
        other => {
            report.warn(format!("Frontend has no buildable sources ({})", other.as_str()));
            false
        }
    }
}

/// Copy a static site into `dist`, leaving out dotfiles such as
/// `.env.production`.
fn copy_static(dir: &Path, dist: &Path) -> anyhow::Result<usize> {
    let walker = WalkDir::new(dir).into_iter().filter_entry(|e| {
        if e.depth() == 0 {
            return true;
        }
        let name = e.file_name().to_str().unwrap_or("");
        !(name.starts_with('.') || (e.file_type().is_dir() && IGNORED_DIRS.contains(&name)))
    });
    let mut count = 0;
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let target = dist.join(entry.path().strip_prefix(dir)?);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(entry.path(), &target)
            .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        count += 1;
    }
    Ok(count)
}

async fn build_and_push(
    image: &str,
    backend_dir: &Path,
    config: &ShipyardConfig,
    report: &mut PublishReport,
) -> bool {
    let timeout = std::time::Duration::from_secs(config.deploy.publish_timeout_secs);
    let docker = &config.deploy.docker_bin;
    let steps = [
        CommandSpec::new(docker).args(["build", "-t", image, "."]),
        CommandSpec::new(docker).args(["push", image]),
    ];
    for spec in steps {
        let spec = spec.current_dir(backend_dir).timeout(timeout);
        let rendered = spec.display();
        match spec.run().await {
            Ok(out) if out.success() => report.log(format!("{} succeeded", rendered)),
            Ok(out) => {
                report.warn(format!("{} failed: {}", rendered, out.diagnostic(2000)));
                return false;
            }
            Err(e) => {
                report.warn(format!("{} failed: {}", rendered, e));
                return false;
            }
        }
    }
    true
}

async fn run_shell(command: &str, dir: &Path, config: &ShipyardConfig, report: &mut PublishReport) -> bool {
    let spec = CommandSpec::shell(command)
        .current_dir(dir)
        .timeout(std::time::Duration::from_secs(config.deploy.publish_timeout_secs));
    match spec.run().await {
        Ok(out) if out.success() => {
            report.log(format!("`{}` succeeded", command));
            let stdout = out.stdout.trim();
            if !stdout.is_empty() {
                report.log(tail(stdout, 1000));
            }
            true
        }
        Ok(out) => {
            report.warn(format!("`{}` failed: {}", command, out.diagnostic(2000)));
            false
        }
        Err(e) => {
            report.warn(format!("`{}` failed: {}", command, e));
            false
        }
    }
}
