// src/config/validate.rs

use std::collections::BTreeSet;

use crate::config::model::{ConfigFile, RawConfigFile, SchedulerConfig};
use crate::errors::{FormicaryError, Result};
use crate::types::ErrorClassifier;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::FormicaryError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let scheduler = SchedulerConfig::from_raw(raw.scheduler);
        validate_scheduler(&scheduler)?;
        validate_ants(&raw.ants)?;
        let classifier = ErrorClassifier::new(raw.error_codes.clone())?;
        Ok(ConfigFile::new_unchecked(
            scheduler,
            raw.encryption,
            raw.ants,
            raw.error_codes,
            classifier,
        ))
    }
}

/// Validate an already-built config, e.g. one assembled in code.
pub fn validate_config(cfg: &ConfigFile) -> Result<()> {
    validate_scheduler(&cfg.scheduler)?;
    validate_ants(&cfg.ants)
}

fn validate_scheduler(s: &SchedulerConfig) -> Result<()> {
    let timeouts = [
        ("max_task_timeout", s.max_task_timeout),
        ("max_job_timeout", s.max_job_timeout),
        ("default_task_timeout", s.default_task_timeout),
        ("ant_liveness_timeout", s.ant_liveness_timeout),
        ("reservation_timeout", s.reservation_timeout),
    ];
    for (name, value) in timeouts {
        if value.is_zero() {
            return Err(FormicaryError::ConfigError(format!(
                "[scheduler].{name} must be greater than zero"
            )));
        }
    }

    if s.max_task_timeout > s.max_job_timeout {
        return Err(FormicaryError::ConfigError(format!(
            "[scheduler].max_task_timeout ({:?}) exceeds max_job_timeout ({:?})",
            s.max_task_timeout, s.max_job_timeout
        )));
    }

    if s.response_topic.trim().is_empty() || s.registration_topic.trim().is_empty() {
        return Err(FormicaryError::ConfigError(
            "[scheduler] topics must not be empty".to_string(),
        ));
    }
    if s.response_topic == s.registration_topic {
        return Err(FormicaryError::ConfigError(format!(
            "[scheduler] response and registration topics must differ (both '{}')",
            s.response_topic
        )));
    }

    Ok(())
}

fn validate_ants(ants: &[crate::config::model::AntConfig]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for ant in ants {
        if ant.ant_id.trim().is_empty() {
            return Err(FormicaryError::ConfigError(
                "[[ants]] entry has an empty ant_id".to_string(),
            ));
        }
        if !seen.insert(ant.ant_id.as_str()) {
            return Err(FormicaryError::ConfigError(format!(
                "duplicate ant_id '{}'",
                ant.ant_id
            )));
        }
        if ant.max_capacity == 0 {
            return Err(FormicaryError::ConfigError(format!(
                "ant '{}' must have max_capacity >= 1",
                ant.ant_id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<ConfigFile> {
        let raw: RawConfigFile = toml::from_str(toml_src)?;
        ConfigFile::try_from(raw)
    }

    fn config_error(result: Result<ConfigFile>) -> String {
        match result {
            Err(FormicaryError::ConfigError(msg)) => msg,
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn empty_file_uses_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.scheduler, SchedulerConfig::default());
        assert!(cfg.ants.is_empty());
        assert!(validate_config(&ConfigFile::default()).is_ok());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let msg = config_error(parse("[scheduler]\nant_liveness_timeout = 0\n"));
        assert!(msg.contains("ant_liveness_timeout"));
    }

    #[test]
    fn task_timeout_cannot_exceed_job_timeout() {
        let msg = config_error(parse(
            "[scheduler]\nmax_task_timeout = \"2h\"\nmax_job_timeout = \"1h\"\n",
        ));
        assert!(msg.contains("exceeds"));
    }

    #[test]
    fn duplicate_and_empty_ants_are_rejected() {
        let msg = config_error(parse(
            "[[ants]]\nant_id = \"a\"\n[[ants]]\nant_id = \"a\"\n",
        ));
        assert!(msg.contains("duplicate"));

        let msg = config_error(parse("[[ants]]\nant_id = \"  \"\n"));
        assert!(msg.contains("empty"));

        let msg = config_error(parse("[[ants]]\nant_id = \"a\"\nmax_capacity = 0\n"));
        assert!(msg.contains("max_capacity"));
    }

    #[test]
    fn broken_error_code_regex_is_rejected() {
        let msg = config_error(parse(
            "[[error_codes]]\nregex = \"(unclosed\"\nerror_code = \"ERR_X\"\n",
        ));
        assert!(msg.contains("ERR_X"));
    }

    #[test]
    fn shared_topics_are_rejected() {
        let msg = config_error(parse(
            "[scheduler]\nresponse_topic = \"t\"\nregistration_topic = \"t\"\n",
        ));
        assert!(msg.contains("differ"));
    }
}
