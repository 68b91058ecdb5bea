// src/protocol/executor_options.rs

//! Per-task executor options shipped to an ant inside a `TaskRequest`.
//!
//! These are parsed from the same YAML fragment as the task definition, so
//! a task can carry container, cache and artifact settings next to its
//! script.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{FormicaryError, Result};
use crate::types::TaskMethod;

/// Volumes mounted into a container.
///
/// The backend is chosen explicitly by the key used in YAML:
///
/// ```yaml
/// volumes:
///   kubernetes:
///     host_path:
///       - name: data
///         mount_path: /data
///         host_path: /var/data
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Volumes {
    /// Docker bind mounts: host path -> container path.
    Docker(BTreeMap<String, String>),
    Kubernetes(KubernetesVolumes),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KubernetesVolumes {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_path: Vec<HostPathVolume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pvc: Vec<PvcVolume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub config_map: Vec<ConfigMapVolume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret: Vec<SecretVolume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub empty_dir: Vec<EmptyDirVolume>,
}

impl KubernetesVolumes {
    pub fn mount_names(&self) -> impl Iterator<Item = &str> {
        self.host_path
            .iter()
            .map(|v| v.name.as_str())
            .chain(self.pvc.iter().map(|v| v.name.as_str()))
            .chain(self.config_map.iter().map(|v| v.name.as_str()))
            .chain(self.secret.iter().map(|v| v.name.as_str()))
            .chain(self.empty_dir.iter().map(|v| v.name.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostPathVolume {
    pub name: String,
    pub mount_path: String,
    pub host_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvcVolume {
    pub name: String,
    pub claim_name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigMapVolume {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub items: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretVolume {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmptyDirVolume {
    pub name: String,
    pub mount_path: String,
}

/// Container image and resource limits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerDefinition {
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Volumes>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub volume_driver: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes_from: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub bind_dir: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cpu_limit: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub cpu_request: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub memory_limit: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub memory_request: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ephemeral_storage_limit: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub ephemeral_storage_request: String,
}

/// A sidecar service started next to the main container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Service {
    pub name: String,
    pub alias: String,
    pub image: String,
    pub command: Vec<String>,
    pub instances: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactsConfig {
    pub paths: Vec<String>,
    pub expires_after: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub key: String,
    pub key_paths: Vec<String>,
    pub paths: Vec<String>,
    pub expires_after: Option<String>,
}

impl CacheConfig {
    pub fn is_enabled(&self) -> bool {
        !self.paths.is_empty() && (!self.key.is_empty() || !self.key_paths.is_empty())
    }
}

/// Everything an ant needs besides the script to run a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorOptions {
    pub name: String,
    pub method: TaskMethod,
    pub environment: BTreeMap<String, String>,
    pub helper_environment: BTreeMap<String, String>,
    pub working_dir: String,
    pub artifacts_dir: String,
    pub artifacts: ArtifactsConfig,
    pub cache_dir: String,
    pub cache: CacheConfig,
    pub dependent_artifact_ids: Vec<String>,
    #[serde(rename = "container")]
    pub main_container: ContainerDefinition,
    #[serde(rename = "helper")]
    pub helper_container: ContainerDefinition,
    pub services: Vec<Service>,
    pub privileged: bool,
    pub node_selector: BTreeMap<String, String>,
    pub node_tolerations: BTreeMap<String, String>,
    pub pod_labels: BTreeMap<String, String>,
    pub pod_annotations: BTreeMap<String, String>,
    pub network_mode: String,
    pub host_network: bool,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub report_stdout: bool,
    pub messaging_request_queue: String,
    pub messaging_reply_queue: String,
    pub fork_job_type: Option<String>,
    pub fork_job_version: Option<String>,
    pub artifact_key_prefix: String,
    pub await_forked_tasks: Vec<String>,
    pub cost_factor: f64,
    pub execute_command_without_shell: bool,
    pub debug: bool,
}

impl ExecutorOptions {
    pub fn new(name: impl Into<String>, method: TaskMethod) -> Self {
        Self {
            name: name.into(),
            method,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.method {
            TaskMethod::ForkJob
                if self.fork_job_type.as_deref().is_none_or(|t| t.trim().is_empty()) =>
            {
                return Err(FormicaryError::Validation(format!(
                    "fork_job_type is not specified for {} method of '{}'",
                    self.method, self.name
                )));
            }
            TaskMethod::AwaitForkedJob if self.await_forked_tasks.is_empty() => {
                return Err(FormicaryError::Validation(format!(
                    "await_forked_tasks is not specified for {} method of '{}'",
                    self.method, self.name
                )));
            }
            TaskMethod::Messaging
                if self.messaging_request_queue.is_empty()
                    || self.messaging_reply_queue.is_empty() =>
            {
                return Err(FormicaryError::Validation(format!(
                    "messaging queues are not specified for '{}'",
                    self.name
                )));
            }
            _ => {}
        }

        if self.cost_factor < 0.0 {
            return Err(FormicaryError::Validation(format!(
                "cost_factor of '{}' cannot be negative",
                self.name
            )));
        }
        if let Some(svc) = self.services.iter().find(|s| s.name.trim().is_empty()) {
            return Err(FormicaryError::Validation(format!(
                "service with image '{}' in '{}' has no name",
                svc.image, self.name
            )));
        }
        Ok(())
    }
}
