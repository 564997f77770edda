use crate::errors::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Workload kinds a sidecar may declare as its owner. Anything else in
/// the config file is a fatal parse error.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum Owner {
    Deployment,
    ReplicaSet,
    DaemonSet,
}

/// One rung of a sidecar's resource ladder. The quantity strings are
/// opaque; they are copied verbatim into pod-template annotations and
/// never parsed here.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ResourceStep {
    pub name: String,
    #[serde(default)]
    pub restart_limit: u32,
    #[serde(default)]
    pub cpu_request: String,
    #[serde(default)]
    pub cpu_limit: String,
    #[serde(default)]
    pub mem_request: String,
    #[serde(default)]
    pub mem_limit: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SidecarConfig {
    #[serde(default)]
    pub err_codes: Vec<i32>,
    pub owner: Owner,
    pub steps: Vec<ResourceStep>,
    #[serde(default)]
    pub cpu_annotation_key: String,
    #[serde(default)]
    pub cpu_limit_annotation_key: String,
    #[serde(default)]
    pub mem_annotation_key: String,
    #[serde(default)]
    pub mem_limit_annotation_key: String,
}

impl Default for Owner {
    fn default() -> Self {
        Owner::Deployment
    }
}

fn default_label_name() -> String {
    String::from("app.kubernetes.io/name")
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Config {
    /// Workload label whose value names the application for export.
    #[serde(default = "default_label_name")]
    pub label_name: String,
    /// Parsed for operators that template the store env from config;
    /// the store itself reads S3_BUCKET.
    #[serde(default)]
    pub s3_bucket: String,
    pub sidecars: BTreeMap<String, SidecarConfig>,
}

impl Config {
    pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .chain_err(|| format!("error opening config file in path {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .chain_err(|| format!("json parsing error for config in path {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// A sidecar without at least one rung has nowhere to start, so the
    /// process refuses to come up.
    fn validate(&self) -> Result<()> {
        for (name, sidecar) in &self.sidecars {
            if sidecar.steps.is_empty() {
                bail!("sidecar {} has an empty steps list", name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "label_name": "app.kubernetes.io/part-of",
        "s3_bucket": "das-steps",
        "sidecars": {
            "envoy": {
                "err_codes": [137, 139],
                "owner": "Deployment",
                "steps": [
                    {"name": "small", "restart_limit": 5, "cpu_request": "100m", "cpu_limit": "200m", "mem_request": "64Mi", "mem_limit": "128Mi"},
                    {"name": "medium", "restart_limit": 5, "cpu_request": "200m", "cpu_limit": "400m", "mem_request": "128Mi", "mem_limit": "256Mi"}
                ],
                "cpu_annotation_key": "das/envoy-cpu-request",
                "cpu_limit_annotation_key": "das/envoy-cpu-limit",
                "mem_annotation_key": "das/envoy-mem-request",
                "mem_limit_annotation_key": "das/envoy-mem-limit"
            }
        }
    }"#;

    #[test]
    fn parses_full_config() {
        let conf: Config = serde_json::from_str(SAMPLE).unwrap();
        conf.validate().unwrap();
        assert_eq!(conf.label_name, "app.kubernetes.io/part-of");
        assert_eq!(conf.s3_bucket, "das-steps");
        let envoy = &conf.sidecars["envoy"];
        assert_eq!(envoy.owner, Owner::Deployment);
        assert_eq!(envoy.err_codes, vec![137, 139]);
        assert_eq!(envoy.steps.len(), 2);
        assert_eq!(envoy.steps[1].mem_limit, "256Mi");
    }

    #[test]
    fn label_name_defaults_when_absent() {
        let conf: Config = serde_json::from_str(r#"{"sidecars": {}}"#).unwrap();
        assert_eq!(conf.label_name, "app.kubernetes.io/name");
    }

    #[test]
    fn unknown_owner_kind_is_a_parse_error() {
        let raw = r#"{
            "sidecars": {
                "envoy": {"owner": "StatefulSet", "steps": [{"name": "s0"}]}
            }
        }"#;
        assert!(serde_json::from_str::<Config>(raw).is_err());
    }

    #[test]
    fn empty_steps_fail_validation() {
        let raw = r#"{
            "sidecars": {
                "envoy": {"owner": "Deployment", "steps": []}
            }
        }"#;
        let conf: Config = serde_json::from_str(raw).unwrap();
        assert!(conf.validate().is_err());
    }

    #[test]
    fn parse_reports_missing_file_path() {
        let err = Config::parse("/definitely/not/here/config.json").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here/config.json"));
    }
}
