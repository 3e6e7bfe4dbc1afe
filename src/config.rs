use crate::error::{EaiError, Result};
use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    /// Declarative component map; the panel builder consumes this uniformly,
    /// never branching on component names.
    pub components: Vec<ComponentSpec>,
    pub panel: PanelConfig,
    pub schedule: ScheduleConfig,
    pub archive: ArchiveConfig,
    pub sink: SinkConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Source table identifier, e.g. "SAINC7".
    pub table: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    /// Region scope passed to the source, e.g. "COUNTY".
    pub region_scope: String,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    /// Upper bound on concurrent per-year fetches during a backfill.
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,
}

/// One named income component: which source line feeds it and with what sign
/// it enters the composite.
#[derive(Debug, Clone, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub line_code: u32,
    pub sign: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositeFormula {
    /// Signed component sum over the unsigned row total.
    ShareRatio,
    /// Signed combination of per-year cross-region share z-scores.
    Zscore,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanelConfig {
    pub formula: CompositeFormula,
    /// Advisory only: rows below this are still emitted; filtering is a
    /// display-layer concern.
    #[serde(default)]
    pub min_history_years: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Month (1-12) in which the external scheduler triggers the provisional run.
    pub provisional_month: u32,
    /// Month (1-12) of the final reconciled run.
    pub final_month: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Root directory holding the archive index and row-set files.
    pub root: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkConfig {
    /// Directory receiving the per-year current snapshot artifacts.
    pub snapshot_dir: String,
    /// Path of the delimited materialized relation read by the API layer.
    pub relation_path: String,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay_secs() -> u64 {
    2
}

fn default_fetch_concurrency() -> usize {
    4
}

impl Config {
    pub fn load(config_path: &str) -> Result<Self> {
        let config_content = fs::read_to_string(config_path).map_err(|e| {
            EaiError::Config(format!(
                "Failed to read config file '{}': {}",
                config_path, e
            ))
        })?;

        let config: Config = toml::from_str(&config_content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.components.is_empty() {
            return Err(EaiError::Config(
                "at least one component must be configured".to_string(),
            ));
        }
        let mut names: Vec<&str> = self.components.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != self.components.len() {
            return Err(EaiError::Config(
                "component names must be unique".to_string(),
            ));
        }
        let mut codes: Vec<u32> = self.components.iter().map(|c| c.line_code).collect();
        codes.sort_unstable();
        codes.dedup();
        if codes.len() != self.components.len() {
            return Err(EaiError::Config(
                "component line codes must be unique".to_string(),
            ));
        }
        for month in [self.schedule.provisional_month, self.schedule.final_month] {
            if !(1..=12).contains(&month) {
                return Err(EaiError::Config(format!(
                    "schedule month {} out of range 1-12",
                    month
                )));
            }
        }
        Ok(())
    }

    /// Line codes the normalizer accepts; anything else is dropped with a warning.
    pub fn known_line_codes(&self) -> Vec<u32> {
        self.components.iter().map(|c| c.line_code).collect()
    }
}
