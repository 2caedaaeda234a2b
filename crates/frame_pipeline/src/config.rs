use std::path::{Path, PathBuf};
use std::time::Duration;

use frame_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse pipeline config")]
    Parse(#[from] serde_json::Error),
    #[error("invalid pipeline config: {0}")]
    Invalid(&'static str),
}

/// How the producer waits for the consumer to apply a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// The producer suspends on the commit gate until the consumer applied the package.
    #[default]
    Blocking,
    /// The gate posts `CommitCompleted` back into the producer mailbox.
    NonBlocking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub commit_mode: CommitMode,
    /// Commits land on the active tree directly and skip activation.
    pub commit_to_active_tree: bool,
    /// Hold the commit gate until the committed tree was activated.
    pub activation_gated_commits: bool,
    pub initially_visible: bool,
    pub frame_interval_micros: u64,
    pub telemetry_ring_capacity: usize,
    pub scheduler: SchedulerConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            commit_mode: CommitMode::Blocking,
            commit_to_active_tree: false,
            activation_gated_commits: false,
            initially_visible: true,
            frame_interval_micros: 16_667,
            telemetry_ring_capacity: 1024,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frame_interval_micros == 0 {
            return Err(ConfigError::Invalid("frame_interval_micros must be non-zero"));
        }
        if self.telemetry_ring_capacity == 0 {
            return Err(ConfigError::Invalid("telemetry_ring_capacity must be non-zero"));
        }
        if self.scheduler.max_consecutive_draw_failures == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.max_consecutive_draw_failures must be non-zero",
            ));
        }
        Ok(())
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros(self.frame_interval_micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = PipelineConfig::from_json_str("{}").expect("parse empty config");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.frame_interval(), Duration::from_micros(16_667));
    }

    #[test]
    fn nested_scheduler_section_merges_with_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{
                "commit_mode": "non_blocking",
                "activation_gated_commits": true,
                "scheduler": { "max_consecutive_draw_failures": 7 }
            }"#,
        )
        .expect("parse config");
        assert_eq!(config.commit_mode, CommitMode::NonBlocking);
        assert!(config.activation_gated_commits);
        assert_eq!(config.scheduler.max_consecutive_draw_failures, 7);
        assert_eq!(
            config.scheduler.smoothness_priority_expiration(),
            Duration::from_millis(250)
        );
    }

    #[test]
    fn zero_interval_is_rejected() {
        let error = PipelineConfig::from_json_str(r#"{ "frame_interval_micros": 0 }"#)
            .expect_err("zero interval must fail");
        assert!(matches!(error, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_json_reports_parse_error() {
        let error = PipelineConfig::from_json_str("{ commit_mode").expect_err("malformed json");
        assert!(matches!(error, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let error = PipelineConfig::from_path("/nonexistent/pipeline.json")
            .expect_err("missing file must fail");
        match error {
            ConfigError::Io { path, .. } => {
                assert_eq!(path, PathBuf::from("/nonexistent/pipeline.json"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
