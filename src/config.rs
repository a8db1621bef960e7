use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::award::{ResolutionStrategy, ScoringWeights};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub negotiation: NegotiationConfig,
    pub collection: CollectionConfig,
    pub award: AwardConfig,
    pub progress: ProgressConfig,
    pub coordinator: CoordinatorConfig,
    pub maintenance: MaintenanceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Bidding deadline used when the caller does not pass one (ms)
    pub default_deadline_ms: u64,
    /// How long closed negotiations are kept before cleanup evicts them (s)
    pub retention_secs: u64,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: 30_000,
            retention_secs: 300,
        }
    }
}

impl NegotiationConfig {
    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Age after which finished bid collections are evicted (s)
    pub max_age_secs: u64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self { max_age_secs: 300 }
    }
}

impl CollectionConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AwardConfig {
    pub weights: ScoringWeights,
    /// Scores closer than this are treated as a tie
    pub tie_epsilon: f64,
    /// Tie-break strategy
    pub strategy: ResolutionStrategy,
}

impl Default for AwardConfig {
    fn default() -> Self {
        Self {
            weights: ScoringWeights::default(),
            tie_epsilon: 0.001,
            strategy: ResolutionStrategy::LoadBalancing,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// How long terminal progress trackers are kept (s)
    pub retention_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            retention_secs: 300,
        }
    }
}

impl ProgressConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Bidding window for each sub-task announcement (ms)
    pub bidding_window_ms: u64,
    /// Extra wait after the bidding window before awarding (ms)
    pub award_grace_ms: u64,
    /// Retention for completed/failed coordinated tasks (s)
    pub completed_retention_secs: u64,
    /// Coordinated tasks stuck in decomposition longer than this are evicted (s)
    pub decomposition_timeout_secs: u64,
    /// Executing composites with no update for this long are failed (s)
    pub execution_timeout_secs: u64,
    /// Interval of the completion monitor (s)
    pub monitor_interval_secs: u64,
    /// Interval of the eviction sweep (s)
    pub cleanup_interval_secs: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bidding_window_ms: 30_000,
            award_grace_ms: 5_000,
            completed_retention_secs: 300,
            decomposition_timeout_secs: 60,
            execution_timeout_secs: 3_600,
            monitor_interval_secs: 5,
            cleanup_interval_secs: 30,
        }
    }
}

impl CoordinatorConfig {
    pub fn bidding_window(&self) -> Duration {
        Duration::from_millis(self.bidding_window_ms)
    }

    pub fn award_delay(&self) -> Duration {
        Duration::from_millis(self.bidding_window_ms + self.award_grace_ms)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }

    pub fn decomposition_timeout(&self) -> Duration {
        Duration::from_secs(self.decomposition_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    /// Validate coordinator values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.bidding_window_ms == 0 {
            errors.push("coordinator.bidding_window_ms must be positive".to_string());
        }

        if self.monitor_interval_secs == 0 || self.cleanup_interval_secs == 0 {
            errors.push("coordinator intervals must be positive".to_string());
        }

        if self.execution_timeout_secs == 0 {
            errors.push("coordinator.execution_timeout_secs must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub negotiation_cleanup_secs: u64,
    pub collection_cleanup_secs: u64,
    pub progress_cleanup_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            negotiation_cleanup_secs: 30,
            collection_cleanup_secs: 60,
            progress_cleanup_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CNP_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (CNP_AWARD__TIE_EPSILON, etc.)
            .add_source(
                Environment::with_prefix("CNP")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if let Err(e) = self.award.weights.validate() {
            errors.push(e.to_string());
        }

        if !(self.award.tie_epsilon > 0.0 && self.award.tie_epsilon < 1.0) {
            errors.push(format!(
                "tie_epsilon must be between 0 and 1, got {}",
                self.award.tie_epsilon
            ));
        }

        if self.negotiation.default_deadline_ms == 0 {
            errors.push("negotiation.default_deadline_ms must be positive".to_string());
        }

        if let Err(e) = self.coordinator.validate() {
            errors.extend(e);
        }

        let m = &self.maintenance;
        if m.negotiation_cleanup_secs == 0
            || m.collection_cleanup_secs == 0
            || m.progress_cleanup_secs == 0
        {
            errors.push("maintenance intervals must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.award.tie_epsilon, 0.001);
        assert_eq!(config.negotiation.retention(), Duration::from_secs(300));
        assert_eq!(config.coordinator.award_delay(), Duration::from_secs(35));
        assert_eq!(
            config.coordinator.decomposition_timeout(),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn validate_collects_every_violation() {
        let mut config = AppConfig::default();
        config.award.tie_epsilon = 0.0;
        config.award.weights.capability = 0.9;
        config.coordinator.bidding_window_ms = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn coordinator_rejects_zero_intervals() {
        let config = CoordinatorConfig {
            monitor_interval_secs: 0,
            execution_timeout_secs: 0,
            ..CoordinatorConfig::default()
        };
        assert_eq!(config.validate().unwrap_err().len(), 2);
        assert!(CoordinatorConfig::default().validate().is_ok());
    }

    #[test]
    fn load_from_missing_dir_uses_defaults() {
        let config = AppConfig::load_from("/nonexistent/cnp-config").unwrap();
        assert_eq!(config.negotiation.default_deadline_ms, 30_000);
        assert_eq!(config.award.strategy, ResolutionStrategy::LoadBalancing);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [award]
            tie_epsilon = 0.01
            strategy = "round_robin"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.award.strategy, ResolutionStrategy::RoundRobin);
        assert_eq!(parsed.award.tie_epsilon, 0.01);
        assert_eq!(parsed.award.weights.capability, 0.40);
        assert_eq!(parsed.progress.retention_secs, 300);
    }
}
