//! Production preparation of a project's sources.
//!
//! Produces a fresh copy under `<deploy_root>/<project_id>/` that can be
//! built and shipped without touching the sandbox workspace.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use walkdir::WalkDir;

use crate::runtime::Side;
use crate::sandbox::toolchain::{IGNORED_DIRS, Toolchain};

const BOUNDARY_NAME: &str = "ShipyardErrorBoundary";

const FRONTEND_ENTRIES: &[&str] = &[
    "src/main.jsx",
    "src/main.tsx",
    "src/main.js",
    "src/index.jsx",
    "src/index.tsx",
    "src/index.js",
];

const BACKEND_ENTRIES: &[&str] = &[
    "server.js",
    "index.js",
    "app.js",
    "src/server.js",
    "src/index.js",
    "main.py",
    "app.py",
    "server.py",
];

const ERROR_BOUNDARY: &str = r#"import React from 'react';

export default class ShipyardErrorBoundary extends React.Component {
  constructor(props) {
    super(props);
    this.state = { error: null };
  }

  static getDerivedStateFromError(error) {
    return { error };
  }

  componentDidCatch(error, info) {
    console.error('Unhandled render error', error, info);
  }

  render() {
    if (this.state.error) {
      return React.createElement(
        'div',
        { role: 'alert', style: { padding: '2rem', fontFamily: 'sans-serif' } },
        React.createElement('h1', null, 'Something went wrong'),
        React.createElement('p', null, 'Please reload the page.')
      );
    }
    return this.props.children;
  }
}
"#;

const NODE_DOCKERFILE: &str = r#"FROM node:20-slim
WORKDIR /app
COPY package*.json ./
RUN npm install --omit=dev --no-audit --no-fund
COPY . .
ENV NODE_ENV=production
ENV PORT=8080
EXPOSE 8080
CMD ["npm", "start"]
"#;

const PYTHON_DOCKERFILE: &str = r#"FROM python:3.12-slim
WORKDIR /app
COPY requirements.txt* ./
RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi
COPY . .
ENV PORT=8080
EXPOSE 8080
CMD ["sh", "-c", "python main.py || python app.py"]
"#;

const DOCKERIGNORE: &str = "node_modules\n.git\n.env\n.env.*\n!.env.production\n.sandbox-logs\n__pycache__\n*.pyc\n.venv\nvenv\n";

/// A prepared production copy.
#[derive(Debug, Clone)]
pub struct PreparedProject {
    pub root: PathBuf,
    pub frontend_dir: PathBuf,
    pub backend_dir: PathBuf,
    /// Human-readable record of what preparation did.
    pub steps: Vec<String>,
}

/// Copy the sources into `deploy_dir` and make them production-ready.
pub fn prepare(source_dir: &Path, deploy_dir: &Path) -> Result<PreparedProject> {
    if deploy_dir.exists() {
        fs::remove_dir_all(deploy_dir)
            .with_context(|| format!("Failed to clear {}", deploy_dir.display()))?;
    }
    let copied = copy_tree(source_dir, deploy_dir)?;

    let mut prepared = PreparedProject {
        root: deploy_dir.to_path_buf(),
        frontend_dir: deploy_dir.join(Side::Frontend.as_str()),
        backend_dir: deploy_dir.join(Side::Backend.as_str()),
        steps: vec![format!(
            "Copied {} files from {}",
            copied,
            source_dir.display()
        )],
    };

    if prepared.frontend_dir.is_dir() {
        write_env_production(
            &prepared.frontend_dir,
            &BTreeMap::from([("NODE_ENV".to_string(), "production".to_string())]),
        )?;
        prepared.steps.push("Wrote frontend .env.production".into());
        if let Some(entry) = wrap_error_boundary(&prepared.frontend_dir)? {
            prepared
                .steps
                .push(format!("Wrapped {} in an error boundary", entry.display()));
        }
    }

    if prepared.backend_dir.is_dir() {
        write_env_production(
            &prepared.backend_dir,
            &BTreeMap::from([
                ("NODE_ENV".to_string(), "production".to_string()),
                ("PORT".to_string(), "8080".to_string()),
            ]),
        )?;
        prepared.steps.push("Wrote backend .env.production".into());
        prepared.steps.extend(ensure_container_files(&prepared.backend_dir)?);
    }

    validate(&prepared)?;
    Ok(prepared)
}

/// Recursively copy `src` to `dst`, skipping [`IGNORED_DIRS`]. Returns the
/// number of files copied.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<usize> {
    let walker = WalkDir::new(src).into_iter().filter_entry(|e| {
        !(e.file_type().is_dir()
            && e.depth() > 0
            && e.file_name().to_str().is_some_and(|n| IGNORED_DIRS.contains(&n)))
    });

    let mut count = 0;
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let rel = entry.path().strip_prefix(src)?;
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
            count += 1;
        }
    }
    Ok(count)
}

/// Merge `vars` into `<dir>/.env.production`, replacing keys that exist.
pub fn write_env_production(dir: &Path, vars: &BTreeMap<String, String>) -> Result<()> {
    let path = dir.join(".env.production");
    let existing = fs::read_to_string(&path).unwrap_or_default();

    let mut lines: Vec<String> = existing
        .lines()
        .filter(|line| {
            let key = line.split('=').next().unwrap_or("").trim();
            !vars.contains_key(key)
        })
        .map(String::from)
        .collect();
    lines.extend(vars.iter().map(|(k, v)| format!("{}={}", k, v)));

    fs::write(&path, lines.join("\n") + "\n")
        .with_context(|| format!("Failed to write {}", path.display()))
}

/// Wrap the rendered `<App />` of the frontend entry in a generated error
/// boundary. Returns the entry that was rewritten, if any.
pub fn wrap_error_boundary(frontend_dir: &Path) -> Result<Option<PathBuf>> {
    let Some(entry) = FRONTEND_ENTRIES
        .iter()
        .map(|e| frontend_dir.join(e))
        .find(|p| p.is_file())
    else {
        return Ok(None);
    };

    let content = fs::read_to_string(&entry)
        .with_context(|| format!("Failed to read {}", entry.display()))?;
    if content.contains(BOUNDARY_NAME) {
        return Ok(None);
    }
    let Some(app_tag) = ["<App />", "<App/>"].into_iter().find(|t| content.contains(t)) else {
        return Ok(None);
    };

    let extension = if entry.extension().and_then(|x| x.to_str()) == Some("tsx") {
        "tsx"
    } else {
        "jsx"
    };
    let boundary = entry.with_file_name(format!("{}.{}", BOUNDARY_NAME, extension));
    let source = if extension == "tsx" {
        // Strict TS projects reject the untyped class fields.
        format!("// @ts-nocheck\n{}", ERROR_BOUNDARY)
    } else {
        ERROR_BOUNDARY.to_string()
    };
    fs::write(&boundary, source)
        .with_context(|| format!("Failed to write {}", boundary.display()))?;

    let wrapped = content.replacen(
        app_tag,
        &format!("<{0}><App /></{0}>", BOUNDARY_NAME),
        1,
    );
    let import = format!("import {0} from './{0}';\n", BOUNDARY_NAME);
    let rewritten = insert_after_imports(&wrapped, &import);
    fs::write(&entry, rewritten).with_context(|| format!("Failed to write {}", entry.display()))?;

    Ok(entry.strip_prefix(frontend_dir).ok().map(Path::to_path_buf))
}

fn insert_after_imports(content: &str, import: &str) -> String {
    let last_import = content
        .lines()
        .enumerate()
        .filter(|(_, line)| line.trim_start().starts_with("import "))
        .map(|(i, _)| i)
        .last();
    match last_import {
        Some(idx) => {
            let mut out = String::with_capacity(content.len() + import.len());
            for (i, line) in content.lines().enumerate() {
                out.push_str(line);
                out.push('\n');
                if i == idx {
                    out.push_str(import);
                }
            }
            out
        }
        None => format!("{}{}", import, content),
    }
}

/// Generate a `Dockerfile` and `.dockerignore` for the backend when absent.
pub fn ensure_container_files(backend_dir: &Path) -> Result<Vec<String>> {
    let mut steps = Vec::new();
    let dockerfile = backend_dir.join("Dockerfile");
    if !dockerfile.exists() {
        let template = match Toolchain::detect(backend_dir) {
            Toolchain::Python => PYTHON_DOCKERFILE,
            _ => NODE_DOCKERFILE,
        };
        fs::write(&dockerfile, template)
            .with_context(|| format!("Failed to write {}", dockerfile.display()))?;
        steps.push("Generated backend Dockerfile".to_string());
    }
    let dockerignore = backend_dir.join(".dockerignore");
    if !dockerignore.exists() {
        fs::write(&dockerignore, DOCKERIGNORE)
            .with_context(|| format!("Failed to write {}", dockerignore.display()))?;
        steps.push("Generated backend .dockerignore".to_string());
    }
    Ok(steps)
}

/// Check the minimum file set a production deploy needs.
pub fn validate(prepared: &PreparedProject) -> Result<()> {
    let mut missing = Vec::new();
    let fe = &prepared.frontend_dir;
    if !fe.join("package.json").is_file() && !fe.join("index.html").is_file() {
        missing.push("frontend/package.json or frontend/index.html");
    }
    let be = &prepared.backend_dir;
    let has_manifest = be.join("package.json").is_file() || be.join("requirements.txt").is_file();
    let has_entry = BACKEND_ENTRIES.iter().any(|e| be.join(e).is_file());
    if !has_manifest && !has_entry {
        missing.push("backend manifest or entry point");
    }
    if !be.join("Dockerfile").is_file() {
        missing.push("backend/Dockerfile");
    }
    if !missing.is_empty() {
        bail!("missing required files: {}", missing.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn sample_project(root: &Path) {
        write(&root.join("frontend/package.json"), r#"{"name":"web"}"#);
        write(
            &root.join("frontend/src/main.jsx"),
            "import React from 'react';\nimport ReactDOM from 'react-dom/client';\nimport App from './App';\n\nReactDOM.createRoot(document.getElementById('root')).render(<App />);\n",
        );
        write(&root.join("frontend/node_modules/react/index.js"), "junk");
        write(&root.join("frontend/dist/index.html"), "stale");
        write(&root.join("backend/package.json"), r#"{"name":"api"}"#);
        write(&root.join("backend/server.js"), "require('express')");
        write(&root.join("backend/.sandbox-logs/backend.log"), "log");
    }

    #[test]
    fn test_prepare_copies_and_generates() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        sample_project(src.path());
        let deploy = out.path().join("p1");

        let prepared = prepare(src.path(), &deploy).unwrap();
        assert!(deploy.join("backend/server.js").is_file());
        assert!(!deploy.join("frontend/node_modules").exists());
        assert!(!deploy.join("frontend/dist").exists());
        assert!(!deploy.join("backend/.sandbox-logs").exists());
        assert!(deploy.join("backend/Dockerfile").is_file());
        assert!(deploy.join("backend/.dockerignore").is_file());

        let env = fs::read_to_string(deploy.join("frontend/.env.production")).unwrap();
        assert!(env.contains("NODE_ENV=production"));

        let main = fs::read_to_string(deploy.join("frontend/src/main.jsx")).unwrap();
        assert!(main.contains("<ShipyardErrorBoundary><App /></ShipyardErrorBoundary>"));
        assert!(main.contains("import ShipyardErrorBoundary from './ShipyardErrorBoundary';"));
        assert!(deploy.join("frontend/src/ShipyardErrorBoundary.jsx").is_file());
        assert!(prepared.steps.iter().any(|s| s.contains("error boundary")));

        // The workspace copy is untouched.
        let original = fs::read_to_string(src.path().join("frontend/src/main.jsx")).unwrap();
        assert!(!original.contains(BOUNDARY_NAME));
    }

    #[test]
    fn test_prepare_replaces_previous_copy() {
        let src = tempfile::tempdir().unwrap();
        let out = tempfile::tempdir().unwrap();
        sample_project(src.path());
        let deploy = out.path().join("p1");
        write(&deploy.join("stale.txt"), "old");

        prepare(src.path(), &deploy).unwrap();
        assert!(!deploy.join("stale.txt").exists());
    }

    #[test]
    fn test_wrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("src/index.tsx"),
            "import App from './App';\nroot.render(<App/>);\n",
        );
        assert!(wrap_error_boundary(dir.path()).unwrap().is_some());
        assert!(wrap_error_boundary(dir.path()).unwrap().is_none());
        let boundary = fs::read_to_string(dir.path().join("src/ShipyardErrorBoundary.tsx")).unwrap();
        assert!(boundary.starts_with("// @ts-nocheck"));
    }

    #[test]
    fn test_env_production_merges_keys() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(".env.production"), "A=1\nVITE_API_URL=old\n").unwrap();
        write_env_production(
            dir.path(),
            &BTreeMap::from([("VITE_API_URL".to_string(), "https://api".to_string())]),
        )
        .unwrap();
        let env = fs::read_to_string(dir.path().join(".env.production")).unwrap();
        assert_eq!(env, "A=1\nVITE_API_URL=https://api\n");
    }

    #[test]
    fn test_python_backend_gets_python_dockerfile() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("requirements.txt"), "flask\n").unwrap();
        ensure_container_files(dir.path()).unwrap();
        let dockerfile = fs::read_to_string(dir.path().join("Dockerfile")).unwrap();
        assert!(dockerfile.starts_with("FROM python"));
    }

    #[test]
    fn test_validate_reports_missing_backend() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("frontend/index.html"), "<html/>");
        let prepared = PreparedProject {
            root: dir.path().to_path_buf(),
            frontend_dir: dir.path().join("frontend"),
            backend_dir: dir.path().join("backend"),
            steps: Vec::new(),
        };
        let err = validate(&prepared).unwrap_err().to_string();
        assert!(err.contains("backend manifest"));
        assert!(err.contains("backend/Dockerfile"));
    }
}
