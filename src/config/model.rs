// src/config/model.rs

use std::time::Duration;

use serde::Deserialize;

use crate::engine::RuntimeOptions;
use crate::resource::{AntRegistration, ResourceManager};
use crate::types::{ErrorClassifier, ErrorCodeRule, TaskMethod};

/// Configuration exactly as read from a TOML file, before validation.
///
/// ```toml
/// [scheduler]
/// max_task_timeout = "1h"
/// ant_liveness_timeout = "30s"
/// saturation_backoff = 4
///
/// [encryption]
/// shared_secret = "change-me"
///
/// [[ants]]
/// ant_id = "local-1"
/// tags = ["local"]
/// max_capacity = 2
///
/// [[error_codes]]
/// regex = "connection refused"
/// error_code = "ERR_NETWORK"
/// action = "RETRY_TASK"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub scheduler: RawSchedulerSection,
    #[serde(default)]
    pub encryption: EncryptionSection,
    #[serde(default)]
    pub ants: Vec<AntConfig>,
    #[serde(default)]
    pub error_codes: Vec<ErrorCodeRule>,
}

/// `[scheduler]` section. Unset values fall back to [`SchedulerConfig::default`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawSchedulerSection {
    #[serde(default, with = "crate::types::duration::optional")]
    pub max_task_timeout: Option<Duration>,
    #[serde(default, with = "crate::types::duration::optional")]
    pub max_job_timeout: Option<Duration>,
    #[serde(default, with = "crate::types::duration::optional")]
    pub default_task_timeout: Option<Duration>,
    #[serde(default, with = "crate::types::duration::optional")]
    pub ant_liveness_timeout: Option<Duration>,
    #[serde(default, with = "crate::types::duration::optional")]
    pub reservation_timeout: Option<Duration>,
    #[serde(default, with = "crate::types::duration::optional")]
    pub ants_unavailable_delay: Option<Duration>,
    #[serde(default)]
    pub saturation_backoff: Option<u32>,
    #[serde(default)]
    pub exit_when_idle: Option<bool>,
    #[serde(default)]
    pub response_topic: Option<String>,
    #[serde(default)]
    pub registration_topic: Option<String>,
}

/// `[encryption]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionSection {
    /// Key used to seal requests and responses of ants without their own
    /// key. Empty means plain JSON.
    #[serde(default)]
    pub shared_secret: String,
}

/// `[[ants]]` entry: an embedded SHELL ant.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AntConfig {
    pub ant_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,
    #[serde(default)]
    pub encryption_key: Option<String>,
}

fn default_max_capacity() -> u32 {
    1
}

impl AntConfig {
    pub fn new(ant_id: impl Into<String>, max_capacity: u32) -> Self {
        Self {
            ant_id: ant_id.into(),
            tags: Vec::new(),
            max_capacity,
            encryption_key: None,
        }
    }

    pub fn registration(&self) -> AntRegistration {
        let mut registration =
            AntRegistration::new(self.ant_id.clone(), vec![TaskMethod::Shell], self.max_capacity);
        registration.tags = self.tags.clone();
        registration.encryption_key = self.encryption_key.clone().filter(|k| !k.is_empty());
        registration
    }
}

/// Resolved scheduler settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    pub max_task_timeout: Duration,
    pub max_job_timeout: Duration,
    pub default_task_timeout: Duration,
    pub ant_liveness_timeout: Duration,
    pub reservation_timeout: Duration,
    pub ants_unavailable_delay: Duration,
    pub saturation_backoff: u32,
    pub exit_when_idle: bool,
    pub response_topic: String,
    pub registration_topic: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let runtime = RuntimeOptions::default();
        Self {
            max_task_timeout: runtime.max_task_timeout,
            max_job_timeout: runtime.max_job_timeout,
            default_task_timeout: runtime.default_task_timeout,
            ant_liveness_timeout: Duration::from_secs(30),
            reservation_timeout: Duration::from_secs(2 * 60),
            ants_unavailable_delay: runtime.ants_unavailable_delay,
            saturation_backoff: runtime.saturation_backoff,
            exit_when_idle: runtime.exit_when_idle,
            response_topic: runtime.response_topic,
            registration_topic: "formicary-ant-registrations".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub(crate) fn from_raw(raw: RawSchedulerSection) -> Self {
        let defaults = Self::default();
        Self {
            max_task_timeout: raw.max_task_timeout.unwrap_or(defaults.max_task_timeout),
            max_job_timeout: raw.max_job_timeout.unwrap_or(defaults.max_job_timeout),
            default_task_timeout: raw
                .default_task_timeout
                .unwrap_or(defaults.default_task_timeout),
            ant_liveness_timeout: raw
                .ant_liveness_timeout
                .unwrap_or(defaults.ant_liveness_timeout),
            reservation_timeout: raw
                .reservation_timeout
                .unwrap_or(defaults.reservation_timeout),
            ants_unavailable_delay: raw
                .ants_unavailable_delay
                .unwrap_or(defaults.ants_unavailable_delay),
            saturation_backoff: raw.saturation_backoff.unwrap_or(defaults.saturation_backoff),
            exit_when_idle: raw.exit_when_idle.unwrap_or(defaults.exit_when_idle),
            response_topic: raw.response_topic.unwrap_or(defaults.response_topic),
            registration_topic: raw.registration_topic.unwrap_or(defaults.registration_topic),
        }
    }
}

/// Validated configuration.
///
/// Only produced by `TryFrom<RawConfigFile>` (see `validate.rs`) or
/// [`ConfigFile::default`], so the rest of the application can rely on
/// sane timeouts, unique ants and compiled error-code rules.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub scheduler: SchedulerConfig,
    pub encryption: EncryptionSection,
    pub ants: Vec<AntConfig>,
    pub error_codes: Vec<ErrorCodeRule>,
    classifier: ErrorClassifier,
}

impl Default for ConfigFile {
    /// Defaults plus a single local ant.
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            encryption: EncryptionSection::default(),
            ants: vec![AntConfig::new("local-1", 2)],
            error_codes: Vec::new(),
            classifier: ErrorClassifier::default(),
        }
    }
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        scheduler: SchedulerConfig,
        encryption: EncryptionSection,
        ants: Vec<AntConfig>,
        error_codes: Vec<ErrorCodeRule>,
        classifier: ErrorClassifier,
    ) -> Self {
        Self {
            scheduler,
            encryption,
            ants,
            error_codes,
            classifier,
        }
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    pub fn runtime_options(&self) -> RuntimeOptions {
        let s = &self.scheduler;
        RuntimeOptions {
            max_task_timeout: s.max_task_timeout,
            max_job_timeout: s.max_job_timeout,
            default_task_timeout: s.default_task_timeout,
            ants_unavailable_delay: s.ants_unavailable_delay,
            saturation_backoff: s.saturation_backoff,
            exit_when_idle: s.exit_when_idle,
            shared_secret: self.encryption.shared_secret.clone(),
            response_topic: s.response_topic.clone(),
        }
    }

    pub fn resource_manager(&self) -> ResourceManager {
        ResourceManager::new(
            self.scheduler.ant_liveness_timeout,
            self.scheduler.reservation_timeout,
        )
    }

    /// Heartbeat period of embedded ants: a third of the liveness window.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.scheduler.ant_liveness_timeout / 3).max(Duration::from_millis(100))
    }
}
