//! Toolchain detection and build/install commands for generated sources.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Instant;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::BuildSection;
use crate::process::{tail, CommandSpec};
use crate::runtime::Side;

/// Directories never scanned or copied.
pub const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    ".sandbox-logs",
    "__pycache__",
    ".venv",
    "venv",
];

const SOURCE_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs", "cjs"];

const NODE_BUILTINS: &[&str] = &[
    "assert", "async_hooks", "buffer", "child_process", "cluster", "console", "constants",
    "crypto", "dgram", "diagnostics_channel", "dns", "domain", "events", "fs", "http", "http2",
    "https", "inspector", "module", "net", "os", "path", "perf_hooks", "process", "punycode",
    "querystring", "readline", "repl", "stream", "string_decoder", "sys", "timers", "tls",
    "trace_events", "tty", "url", "util", "v8", "vm", "wasi", "worker_threads", "zlib",
];

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:\bfrom\s*|\bimport\s*\(?\s*|\brequire\s*\(\s*)['"]([^'"\n]+)['"]"#)
        .unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Toolchain {
    Node,
    Python,
    Static,
    None,
}

impl Toolchain {
    pub fn detect(dir: &Path) -> Self {
        if dir.join("package.json").is_file() {
            return Toolchain::Node;
        }
        if dir.join("requirements.txt").is_file() || has_python_sources(dir) {
            return Toolchain::Python;
        }
        if dir.join("index.html").is_file() {
            return Toolchain::Static;
        }
        Toolchain::None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Toolchain::Node => "node",
            Toolchain::Python => "python",
            Toolchain::Static => "static",
            Toolchain::None => "none",
        }
    }
}

fn has_python_sources(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.path().extension().and_then(|x| x.to_str()) == Some("py"))
        })
        .unwrap_or(false)
}

/// Whether `dir` exists and contains at least one entry.
pub fn is_non_empty_dir(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn read_manifest(dir: &Path) -> Option<serde_json::Value> {
    let content = std::fs::read_to_string(dir.join("package.json")).ok()?;
    serde_json::from_str(&content).ok()
}

fn has_script(dir: &Path, name: &str) -> bool {
    read_manifest(dir)
        .and_then(|m| m.get("scripts")?.get(name).map(|_| ()))
        .is_some()
}

/// Package name of a bare import specifier, `None` for relative paths,
/// aliases, URLs and Node builtins.
pub fn package_name(specifier: &str) -> Option<String> {
    let spec = specifier.trim();
    if spec.is_empty()
        || spec.starts_with('.')
        || spec.starts_with('/')
        || spec.starts_with('#')
        || spec.starts_with("~/")
        || spec.starts_with("@/")
        || spec.starts_with("node:")
        || spec.starts_with("virtual:")
        || spec.contains("://")
    {
        return None;
    }
    let mut parts = spec.split('/');
    let first = parts.next()?;
    let name = if first.starts_with('@') {
        format!("{}/{}", first, parts.next()?)
    } else {
        first.to_string()
    };
    if NODE_BUILTINS.contains(&name.as_str()) {
        return None;
    }
    Some(name)
}

/// Bare packages imported by the sources but not declared in `package.json`.
pub fn missing_dependencies(dir: &Path) -> BTreeSet<String> {
    let Some(manifest) = read_manifest(dir) else {
        return BTreeSet::new();
    };
    let mut declared: BTreeSet<String> = BTreeSet::new();
    for key in ["dependencies", "devDependencies", "peerDependencies", "optionalDependencies"] {
        if let Some(deps) = manifest.get(key).and_then(|d| d.as_object()) {
            declared.extend(deps.keys().cloned());
        }
    }
    if let Some(own) = manifest.get("name").and_then(|n| n.as_str()) {
        declared.insert(own.to_string());
    }

    let walker = WalkDir::new(dir).into_iter().filter_entry(|e| {
        !(e.file_type().is_dir()
            && e.depth() > 0
            && e.file_name().to_str().is_some_and(|n| IGNORED_DIRS.contains(&n)))
    });

    let mut missing = BTreeSet::new();
    for entry in walker.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_source = path
            .extension()
            .and_then(|x| x.to_str())
            .is_some_and(|x| SOURCE_EXTENSIONS.contains(&x));
        if !entry.file_type().is_file() || !is_source {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(path) else {
            continue;
        };
        for cap in IMPORT_RE.captures_iter(&content) {
            if let Some(name) = package_name(&cap[1]) {
                if !declared.contains(&name) {
                    missing.insert(name);
                }
            }
        }
    }
    missing
}

/// Declare `names` in `package.json` at version `latest`.
pub fn add_dependencies(dir: &Path, names: &BTreeSet<String>) -> Result<()> {
    if names.is_empty() {
        return Ok(());
    }
    let path = dir.join("package.json");
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let mut manifest: serde_json::Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    let root = manifest
        .as_object_mut()
        .context("package.json is not an object")?;
    let deps = root
        .entry("dependencies")
        .or_insert_with(|| serde_json::Value::Object(Default::default()));
    let deps = deps
        .as_object_mut()
        .context("package.json dependencies is not an object")?;
    for name in names {
        deps.entry(name.clone())
            .or_insert_with(|| serde_json::Value::String("latest".to_string()));
    }
    let updated = serde_json::to_string_pretty(&manifest)?;
    std::fs::write(&path, updated + "\n")
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// Outcome of one install or build step.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub side: Side,
    pub toolchain: Toolchain,
    pub success: bool,
    pub skipped: bool,
    pub command: Option<String>,
    pub duration_ms: u64,
    pub output: String,
}

impl StepResult {
    fn skipped(side: Side, toolchain: Toolchain, reason: &str) -> Self {
        Self {
            side,
            toolchain,
            success: true,
            skipped: true,
            command: None,
            duration_ms: 0,
            output: reason.to_string(),
        }
    }
}

async fn run_step(side: Side, toolchain: Toolchain, spec: CommandSpec) -> StepResult {
    let started = Instant::now();
    let command = spec.display();
    let (success, output) = match spec.run().await {
        Ok(out) => (out.success(), tail(&out.combined(), 2000)),
        Err(e) => (false, e.to_string()),
    };
    StepResult {
        side,
        toolchain,
        success,
        skipped: false,
        command: Some(command),
        duration_ms: started.elapsed().as_millis() as u64,
        output,
    }
}

/// Install dependencies for one side.
pub async fn install(side: Side, dir: &Path, build: &BuildSection) -> StepResult {
    let toolchain = Toolchain::detect(dir);
    let spec = match toolchain {
        Toolchain::Node => CommandSpec::new(&build.npm_bin).args(["install", "--no-audit", "--no-fund"]),
        Toolchain::Python if dir.join("requirements.txt").is_file() => {
            CommandSpec::new(&build.python_bin).args(["-m", "pip", "install", "-r", "requirements.txt"])
        }
        _ => return StepResult::skipped(side, toolchain, "nothing to install"),
    };
    run_step(side, toolchain, spec.current_dir(dir).timeout(build.install_timeout())).await
}

/// Build (or syntax-check) one side.
pub async fn build(side: Side, dir: &Path, build: &BuildSection) -> StepResult {
    let toolchain = Toolchain::detect(dir);
    let spec = match toolchain {
        Toolchain::Node if has_script(dir, "build") => {
            CommandSpec::new(&build.npm_bin).args(["run", "build"])
        }
        Toolchain::Node => match node_entry(dir) {
            Some(entry) => CommandSpec::new("node").args(["--check", entry]),
            None => return StepResult::skipped(side, toolchain, "no build script or entry point"),
        },
        Toolchain::Python => CommandSpec::new(&build.python_bin).args([
            "-m",
            "compileall",
            "-q",
            "-x",
            r"(node_modules|\.venv|venv)",
            ".",
        ]),
        Toolchain::Static => {
            return StepResult::skipped(side, toolchain, "static site, nothing to build");
        }
        Toolchain::None => {
            return StepResult {
                success: false,
                ..StepResult::skipped(side, toolchain, "no recognizable sources")
            };
        }
    };
    run_step(side, toolchain, spec.current_dir(dir).timeout(build.build_timeout())).await
}

fn node_entry(dir: &Path) -> Option<&'static str> {
    ["server.js", "index.js", "app.js", "src/server.js", "src/index.js"]
        .into_iter()
        .find(|e| dir.join(e).is_file())
}
