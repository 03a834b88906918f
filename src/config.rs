//! TOML configuration: fetch/AI settings, trigger schedules and the
//! processed feed definitions.

use std::path::Path;

use serde::Deserialize;

use crate::cron::CronSchedule;
use crate::summarizer::SummaryConfig;
use crate::types::{BrewError, FetchConfig, ProcessedFeed, Result};

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub ai: SummaryConfig,
    /// Digests are POSTed here when set; delivery failures are logged only.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_update_schedule")]
    pub update_schedule: String,
    #[serde(default = "default_digest_schedule")]
    pub digest_schedule: String,
    #[serde(default, rename = "feed")]
    pub feeds: Vec<ProcessedFeed>,
}

impl Config {
    /// Load and validate a config file. The AI credential falls back to the
    /// OPENAI_API_KEY environment variable.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config =
            toml::from_str(&raw).map_err(|e| BrewError::Config(e.to_string()))?;

        if config.ai.api_key.as_deref().unwrap_or("").is_empty() {
            config.ai.api_key = std::env::var("OPENAI_API_KEY")
                .ok()
                .filter(|k| !k.is_empty());
        }

        // Schedules and feed names fail at load time, not mid-cycle.
        CronSchedule::parse(&config.update_schedule)?;
        CronSchedule::parse(&config.digest_schedule)?;
        let mut names: Vec<&str> = config.feeds.iter().map(|f| f.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != config.feeds.len() {
            return Err(BrewError::Config(
                "processed feed names must be unique".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn update_schedule(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.update_schedule)
    }

    pub fn digest_schedule(&self) -> Result<CronSchedule> {
        CronSchedule::parse(&self.digest_schedule)
    }
}

fn default_update_schedule() -> String {
    "0 * * * *".to_string()
}

fn default_digest_schedule() -> String {
    "0 0 * * *".to_string()
}
