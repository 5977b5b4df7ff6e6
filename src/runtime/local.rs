//! Local-process runtime backend.

use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{
    fallback, stop_local_handle, RuntimeBackend, RuntimeHandle, RuntimeKind, Side, SideSpec,
    StartedSide,
};
use crate::config::RuntimeSection;
use crate::errors::RuntimeError;

/// How to launch a side found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl LaunchCommand {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn describe(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

const NODE_ENTRIES: &[&str] = &[
    "server.js",
    "index.js",
    "app.js",
    "src/server.js",
    "src/index.js",
    "src/app.js",
];
const PYTHON_ENTRIES: &[&str] = &["main.py", "app.py", "server.py"];

/// Find a runnable entry point for `side` in `dir`.
pub fn detect_entry(side: Side, dir: &Path, port: u16, config: &RuntimeSection) -> Option<LaunchCommand> {
    if let Some(scripts) = package_scripts(dir) {
        let preferred: &[&str] = match side {
            Side::Frontend => &["dev", "start"],
            Side::Backend => &["start", "dev"],
        };
        for name in preferred {
            if let Some(body) = scripts.get(*name).and_then(|v| v.as_str()) {
                let mut cmd = LaunchCommand::new("npm", &["run", *name]);
                if body.contains("vite") {
                    let port = port.to_string();
                    cmd.args.extend(
                        ["--", "--port", port.as_str(), "--strictPort", "--host", "127.0.0.1"]
                            .iter()
                            .map(|s| s.to_string()),
                    );
                }
                return Some(cmd);
            }
        }
    }

    if let Some(entry) = NODE_ENTRIES.iter().find(|e| dir.join(e).is_file()) {
        return Some(LaunchCommand::new(&config.node_bin, &[*entry]));
    }
    if let Some(entry) = PYTHON_ENTRIES.iter().find(|e| dir.join(e).is_file()) {
        return Some(LaunchCommand::new(&config.python_bin, &[*entry]));
    }
    None
}

fn package_scripts(dir: &Path) -> Option<serde_json::Map<String, serde_json::Value>> {
    let content = std::fs::read_to_string(dir.join("package.json")).ok()?;
    let manifest: serde_json::Value = serde_json::from_str(&content).ok()?;
    manifest.get("scripts")?.as_object().cloned()
}

pub struct LocalBackend {
    config: RuntimeSection,
}

impl LocalBackend {
    pub fn new(config: RuntimeSection) -> Self {
        Self { config }
    }
}

#[async_trait]
impl RuntimeBackend for LocalBackend {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Local
    }

    async fn start(&self, spec: &SideSpec) -> Result<StartedSide, RuntimeError> {
        let url = format!("http://127.0.0.1:{}", spec.port);
        let Some(launch) = detect_entry(spec.side, &spec.dir, spec.port, &self.config) else {
            info!(side = %spec.side, project_id = %spec.project_id, "no entry point, starting fallback responder");
            let handle = fallback::spawn_responder(spec.side, &spec.dir, spec.port).await?;
            return Ok(StartedSide {
                handle: RuntimeHandle::Responder(handle),
                url,
                entry: "fallback responder".to_string(),
            });
        };

        // The process binds later; refuse a port that is taken right now.
        if std::net::TcpListener::bind(("127.0.0.1", spec.port)).is_err() {
            return Err(RuntimeError::PortInUse(spec.port));
        }

        let log_path = spec.log_dir.join(format!("{}.log", spec.side));
        let log = File::create(&log_path)?;
        let log_err = log.try_clone()?;

        let mut child = Command::new(&launch.program)
            .args(&launch.args)
            .current_dir(&spec.dir)
            .envs(&spec.env)
            .env("HOST", "127.0.0.1")
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RuntimeError::StartFailed {
                side: spec.side.to_string(),
                message: format!("{}: {}", launch.describe(), e),
            })?;

        // Catch entry points that die immediately.
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Ok(Some(status)) = child.try_wait() {
            let tail = std::fs::read_to_string(&log_path).unwrap_or_default();
            return Err(RuntimeError::StartFailed {
                side: spec.side.to_string(),
                message: format!(
                    "{} exited with {}: {}",
                    launch.describe(),
                    status,
                    crate::process::tail(tail.trim(), 500)
                ),
            });
        }

        debug!(side = %spec.side, pid = ?child.id(), command = %launch.describe(), "local process started");
        Ok(StartedSide {
            handle: RuntimeHandle::Process(child),
            url,
            entry: launch.describe(),
        })
    }

    async fn stop(&self, handle: RuntimeHandle) {
        stop_local_handle(handle).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::fs;

    #[test]
    fn test_detect_npm_scripts_by_side() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("package.json"),
            r#"{"scripts": {"dev": "vite", "start": "node server.js"}}"#,
        )
        .unwrap();
        let cfg = RuntimeSection::default();

        let fe = detect_entry(Side::Frontend, dir.path(), 41001, &cfg).unwrap();
        assert_eq!(fe.program, "npm");
        assert_eq!(&fe.args[..2], &["run", "dev"]);
        assert!(fe.args.contains(&"41001".to_string()));

        let be = detect_entry(Side::Backend, dir.path(), 42001, &cfg).unwrap();
        assert_eq!(be.describe(), "npm run start");
    }

    #[test]
    fn test_detect_plain_node_and_python() {
        let cfg = RuntimeSection::default();
        let node = tempfile::tempdir().unwrap();
        fs::create_dir_all(node.path().join("src")).unwrap();
        fs::write(node.path().join("src/index.js"), "").unwrap();
        assert_eq!(
            detect_entry(Side::Backend, node.path(), 1, &cfg).unwrap().describe(),
            "node src/index.js"
        );

        let py = tempfile::tempdir().unwrap();
        fs::write(py.path().join("app.py"), "").unwrap();
        assert_eq!(
            detect_entry(Side::Backend, py.path(), 1, &cfg).unwrap().describe(),
            "python3 app.py"
        );
    }

    #[test]
    fn test_detect_nothing_runnable() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<html/>").unwrap();
        assert!(detect_entry(Side::Frontend, dir.path(), 1, &RuntimeSection::default()).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_that_exits_immediately_is_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let side_dir = dir.path().join("backend");
        fs::create_dir_all(&side_dir).unwrap();
        fs::write(side_dir.join("main.py"), "").unwrap();

        let backend = LocalBackend::new(RuntimeSection {
            python_bin: "false".into(),
            ..RuntimeSection::default()
        });
        let spec = SideSpec {
            side: Side::Backend,
            project_id: "p1".into(),
            dir: side_dir,
            log_dir: dir.path().to_path_buf(),
            port: 42999,
            env: BTreeMap::new(),
        };
        let err = backend.start(&spec).await.unwrap_err();
        assert!(matches!(err, RuntimeError::StartFailed { .. }));
        assert!(dir.path().join("backend.log").exists());
    }
}
