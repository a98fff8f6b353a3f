//! Configuration: optional TOML file overlaid with `DOCKET__*` environment
//! variables (double underscore separates nesting, e.g. `DOCKET__FUSION__K=30`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentKind;
use crate::channel::DEFAULT_UPDATE_BUFFER;
use crate::error::DocketError;
use crate::fusion::FusionConfig;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocketConfig {
    pub orchestrator: OrchestratorSection,
    pub fusion: FusionConfig,
    pub tracker: TrackerSection,
    pub logging: LoggingSection,
}

/// [orchestrator] section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    /// Agents every query is fanned out to
    pub agents: Vec<AgentKind>,
    /// Per-agent time budget
    pub agent_budget_ms: u64,
    /// Added to the budget to form the query-wide ttl
    pub slack_ms: u64,
    /// Upper bound on one call to the text generator
    pub synthesis_budget_ms: u64,
    /// Sender id stamped on outgoing envelopes
    pub sender: String,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            agents: AgentKind::ALL.to_vec(),
            agent_budget_ms: 20_000,
            slack_ms: 5_000,
            synthesis_budget_ms: 30_000,
            sender: "orchestrator".to_string(),
        }
    }
}

impl OrchestratorSection {
    pub fn agent_budget(&self) -> Duration {
        Duration::from_millis(self.agent_budget_ms)
    }

    pub fn synthesis_budget(&self) -> Duration {
        Duration::from_millis(self.synthesis_budget_ms)
    }

    /// Overall query timeout: per-agent budget plus slack
    pub fn query_ttl(&self) -> Duration {
        Duration::from_millis(self.agent_budget_ms.saturating_add(self.slack_ms))
    }
}

/// [tracker] section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    /// Updates buffered per task before slow subscribers start lagging
    pub update_buffer: usize,
    /// How long finished tasks stay queryable; 0 keeps them forever
    pub retention_ms: u64,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            update_buffer: DEFAULT_UPDATE_BUFFER,
            retention_ms: 3_600_000,
        }
    }
}

impl TrackerSection {
    pub fn retention(&self) -> Option<Duration> {
        (self.retention_ms > 0).then(|| Duration::from_millis(self.retention_ms))
    }
}

/// [logging] section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl DocketConfig {
    pub fn validate(&self) -> Result<(), DocketError> {
        if self.orchestrator.agents.is_empty() {
            return Err(DocketError::Config("orchestrator.agents must not be empty".into()));
        }
        if self.orchestrator.agent_budget_ms == 0 {
            return Err(DocketError::Config(
                "orchestrator.agent_budget_ms must be greater than zero".into(),
            ));
        }
        if self.orchestrator.synthesis_budget_ms == 0 {
            return Err(DocketError::Config(
                "orchestrator.synthesis_budget_ms must be greater than zero".into(),
            ));
        }
        if self.orchestrator.sender.trim().is_empty() {
            return Err(DocketError::Config("orchestrator.sender must not be empty".into()));
        }
        if self.tracker.update_buffer == 0 {
            return Err(DocketError::Config(
                "tracker.update_buffer must be greater than zero".into(),
            ));
        }
        self.fusion.validate()
    }
}

/// Load configuration from an optional file plus the environment
pub fn load(path: Option<&Path>) -> Result<DocketConfig, DocketError> {
    let mut builder = config::Config::builder();

    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DOCKET")
            .separator("__")
            .try_parsing(true),
    );

    let config: DocketConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = DocketConfig::default();
        assert_eq!(config.orchestrator.agents, AgentKind::ALL.to_vec());
        assert_eq!(config.fusion.k, 60.0);
        assert_eq!(config.orchestrator.query_ttl(), Duration::from_secs(25));
        assert_eq!(config.tracker.retention(), Some(Duration::from_secs(3600)));
        assert_eq!(config.orchestrator.synthesis_budget(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
[orchestrator]
agents = ["local", "drift"]
agent_budget_ms = 1500
slack_ms = 500

[fusion]
k = 10.0
top_n = 5

[tracker]
retention_ms = 0
"#,
        );
        let config = load(Some(file.path())).unwrap();

        assert_eq!(config.orchestrator.agents, vec![AgentKind::Local, AgentKind::Drift]);
        assert_eq!(config.orchestrator.agent_budget(), Duration::from_millis(1500));
        assert_eq!(config.orchestrator.query_ttl(), Duration::from_secs(2));
        assert_eq!(config.fusion.k, 10.0);
        assert_eq!(config.fusion.top_n, Some(5));
        assert_eq!(config.orchestrator.sender, "orchestrator");
        assert_eq!(config.tracker.retention(), None);
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let file = write_config("[orchestrator]\nagents = []\n");
        assert!(matches!(load(Some(file.path())), Err(DocketError::Config(_))));

        let file = write_config("[fusion]\nk = -3.0\n");
        assert!(matches!(load(Some(file.path())), Err(DocketError::Config(_))));

        let file = write_config("[orchestrator]\nsynthesis_budget_ms = 0\n");
        assert!(matches!(load(Some(file.path())), Err(DocketError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(load(Some(missing.as_path())).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("DOCKET__TRACKER__UPDATE_BUFFER", "7");
        let config = load(None);
        std::env::remove_var("DOCKET__TRACKER__UPDATE_BUFFER");

        assert_eq!(config.unwrap().tracker.update_buffer, 7);
    }
}
