//! Normalizing `terraform output -json` into a resource map.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::InfraError;

const FRONTEND_KEYS: &[&str] = &[
    "frontend_url",
    "website_url",
    "cloudfront_url",
    "cloudfront_domain_name",
    "s3_website_endpoint",
];
const BACKEND_KEYS: &[&str] = &[
    "backend_url",
    "api_url",
    "api_endpoint",
    "alb_dns_name",
    "lb_dns_name",
];
const DATABASE_KEYS: &[&str] = &["database_url", "db_endpoint", "rds_endpoint"];
const BUCKET_KEYS: &[&str] = &["frontend_bucket", "s3_bucket_name", "bucket_name"];
const REGISTRY_KEYS: &[&str] = &["backend_repository_url", "ecr_repository_url", "repository_url"];
const CLUSTER_KEYS: &[&str] = &["ecs_cluster_name", "cluster_name"];
const SERVICE_KEYS: &[&str] = &["ecs_service_name", "service_name"];

/// Provisioned resources with normalized addresses plus every raw output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedResources {
    pub frontend_url: Option<String>,
    pub backend_url: Option<String>,
    pub database_url: Option<String>,
    /// Output name → value, sensitive values included.
    pub outputs: BTreeMap<String, Value>,
    /// Names of outputs flagged sensitive.
    #[serde(default)]
    pub sensitive: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OutputEntry {
    #[serde(default)]
    sensitive: bool,
    value: Value,
}

impl ProvisionedResources {
    /// Parse the document printed by `terraform output -json`.
    pub fn from_output_json(doc: &Value) -> Result<Self, InfraError> {
        let entries: BTreeMap<String, OutputEntry> =
            serde_json::from_value(doc.clone()).map_err(InfraError::OutputParse)?;

        let mut resources = ProvisionedResources::default();
        for (name, entry) in entries {
            if entry.sensitive {
                resources.sensitive.push(name.clone());
            }
            resources.outputs.insert(name, entry.value);
        }
        resources.frontend_url = resources.first_string(FRONTEND_KEYS).map(|v| with_scheme(&v));
        resources.backend_url = resources.first_string(BACKEND_KEYS).map(|v| with_scheme(&v));
        resources.database_url = resources.first_string(DATABASE_KEYS);
        Ok(resources)
    }

    fn first_string(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|k| self.outputs.get(*k))
            .filter_map(Value::as_str)
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(String::from)
    }

    /// Storage bucket for the frontend build, when provisioned.
    pub fn frontend_bucket(&self) -> Option<String> {
        self.first_string(BUCKET_KEYS)
    }

    /// Container registry repository for the backend image, when provisioned.
    pub fn backend_repository(&self) -> Option<String> {
        self.first_string(REGISTRY_KEYS)
    }

    pub fn cluster_name(&self) -> Option<String> {
        self.first_string(CLUSTER_KEYS)
    }

    pub fn service_name(&self) -> Option<String> {
        self.first_string(SERVICE_KEYS)
    }

    pub fn is_sensitive(&self, name: &str) -> bool {
        self.sensitive.iter().any(|s| s == name)
    }

    /// Output names with sensitive values masked, for logs.
    pub fn redacted(&self) -> BTreeMap<String, Value> {
        self.outputs
            .iter()
            .map(|(k, v)| {
                if self.is_sensitive(k) {
                    (k.clone(), Value::String("(sensitive)".into()))
                } else {
                    (k.clone(), v.clone())
                }
            })
            .collect()
    }

    /// The map persisted on the project record.
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        let mut map = self.outputs.clone();
        if let Some(url) = &self.frontend_url {
            map.insert("frontend_url".into(), Value::String(url.clone()));
        }
        if let Some(url) = &self.backend_url {
            map.insert("backend_url".into(), Value::String(url.clone()));
        }
        if let Some(url) = &self.database_url {
            map.insert("database_url".into(), Value::String(url.clone()));
        }
        map
    }
}

fn with_scheme(address: &str) -> String {
    if address.contains("://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalizes_aliases_and_keeps_raw_outputs() {
        let doc = json!({
            "s3_website_endpoint": {"sensitive": false, "type": "string", "value": "site.s3-website.amazonaws.com"},
            "api_url": {"sensitive": false, "type": "string", "value": "https://api.example.com"},
            "rds_endpoint": {"sensitive": true, "type": "string", "value": "db.internal:5432"},
            "bucket_name": {"sensitive": false, "type": "string", "value": "site-bucket"},
            "tags": {"sensitive": false, "type": ["map", "string"], "value": {"env": "prod"}}
        });
        let res = ProvisionedResources::from_output_json(&doc).unwrap();

        assert_eq!(res.frontend_url.as_deref(), Some("http://site.s3-website.amazonaws.com"));
        assert_eq!(res.backend_url.as_deref(), Some("https://api.example.com"));
        assert_eq!(res.database_url.as_deref(), Some("db.internal:5432"));
        assert_eq!(res.frontend_bucket().as_deref(), Some("site-bucket"));
        assert_eq!(res.outputs["tags"], json!({"env": "prod"}));
        assert!(res.is_sensitive("rds_endpoint"));
    }

    #[test]
    fn test_preferred_key_wins() {
        let doc = json!({
            "frontend_url": {"value": "https://app.example.com"},
            "cloudfront_url": {"value": "https://d123.cloudfront.net"}
        });
        let res = ProvisionedResources::from_output_json(&doc).unwrap();
        assert_eq!(res.frontend_url.as_deref(), Some("https://app.example.com"));
    }

    #[test]
    fn test_redacted_masks_sensitive_values() {
        let doc = json!({
            "database_url": {"sensitive": true, "value": "postgres://u:secret@h/db"},
            "backend_url": {"value": "http://b"}
        });
        let res = ProvisionedResources::from_output_json(&doc).unwrap();
        let redacted = res.redacted();
        assert_eq!(redacted["database_url"], json!("(sensitive)"));
        assert_eq!(redacted["backend_url"], json!("http://b"));
        assert_eq!(res.to_map()["database_url"], json!("postgres://u:secret@h/db"));
    }

    #[test]
    fn test_empty_document() {
        let res = ProvisionedResources::from_output_json(&json!({})).unwrap();
        assert!(res.outputs.is_empty());
        assert!(res.frontend_url.is_none());
    }

    #[test]
    fn test_malformed_document() {
        assert!(ProvisionedResources::from_output_json(&json!([1, 2])).is_err());
    }
}
