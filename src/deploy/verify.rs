//! End-to-end checks of a deployed application.

use std::time::Duration;

use reqwest::header::{ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN};
use tracing::debug;

use crate::project::{CheckResult, VerificationResults};

const BACKEND_HEALTH_PATHS: &[&str] = &["/health", "/api/health"];

pub struct Verifier {
    client: reqwest::Client,
}

impl Verifier {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Run all three checks. Missing addresses fail the affected checks.
    pub async fn verify(&self, frontend_url: Option<&str>, backend_url: Option<&str>) -> VerificationResults {
        let backend_health = match backend_url {
            Some(url) => self.backend_health(url).await,
            None => not_provisioned("backend"),
        };
        let frontend_reachable = match frontend_url {
            Some(url) => self.frontend_reachable(url).await,
            None => not_provisioned("frontend"),
        };
        let integration = match (frontend_url, backend_url) {
            (Some(fe), Some(be)) => self.integration(fe, be).await,
            _ => CheckResult {
                passed: false,
                status_code: None,
                detail: "integration needs both addresses".to_string(),
            },
        };
        VerificationResults {
            backend_health,
            frontend_reachable,
            integration,
        }
    }

    async fn backend_health(&self, base: &str) -> CheckResult {
        let mut last = not_provisioned("backend");
        for path in BACKEND_HEALTH_PATHS {
            let url = join(base, path);
            last = self.get(&url).await;
            if last.passed {
                break;
            }
        }
        last
    }

    async fn frontend_reachable(&self, base: &str) -> CheckResult {
        self.get(&join(base, "/")).await
    }

    /// Request the backend as the browser would from the frontend origin and
    /// require the response to allow that origin.
    async fn integration(&self, frontend: &str, backend: &str) -> CheckResult {
        let origin = frontend.trim_end_matches('/');
        let mut result = CheckResult {
            passed: false,
            status_code: None,
            detail: String::new(),
        };
        for path in BACKEND_HEALTH_PATHS {
            let url = join(backend, path);
            let response = match self.client.get(&url).header(ORIGIN, origin).send().await {
                Ok(r) => r,
                Err(e) => {
                    result.detail = format!("{} unreachable: {}", url, e);
                    continue;
                }
            };
            let status = response.status();
            result.status_code = Some(status.as_u16());
            if !status.is_success() {
                result.detail = format!("{} returned {}", url, status);
                continue;
            }
            let allowed = response
                .headers()
                .get(ACCESS_CONTROL_ALLOW_ORIGIN)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            match allowed.as_deref() {
                Some("*") => {
                    result.passed = true;
                    result.detail = format!("{} allows any origin", url);
                }
                Some(value) if value.trim_end_matches('/') == origin => {
                    result.passed = true;
                    result.detail = format!("{} allows {}", url, origin);
                }
                Some(value) => {
                    result.detail = format!("{} allows {} but not {}", url, value, origin);
                }
                None => {
                    result.detail = format!("{} sent no Access-Control-Allow-Origin", url);
                }
            }
            break;
        }
        debug!(passed = result.passed, detail = %result.detail, "integration check");
        result
    }

    async fn get(&self, url: &str) -> CheckResult {
        match self.client.get(url).send().await {
            Ok(resp) => {
                let status = resp.status();
                CheckResult {
                    passed: status.is_success(),
                    status_code: Some(status.as_u16()),
                    detail: format!("{} returned {}", url, status),
                }
            }
            Err(e) => CheckResult {
                passed: false,
                status_code: None,
                detail: format!("{} unreachable: {}", url, e),
            },
        }
    }
}

fn join(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

fn not_provisioned(side: &str) -> CheckResult {
    CheckResult {
        passed: false,
        status_code: None,
        detail: format!("no {} address was provisioned", side),
    }
}
