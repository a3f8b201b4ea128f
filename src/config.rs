use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::mapping::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MappingConfig {
    pub search: SearchConfig,
    pub matching: MatchingConfig,
    pub retry: RetryConfig,
    pub review: ReviewConfig,
    pub render: RenderConfig,
    pub classifier: ClassifierConfig,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SearchConfig {
    /// Pages either side of a predicted start that are classified.
    pub neighborhood_radius: usize,
    /// Widest window an anchor or retained evidence may come from.
    pub max_search_radius: usize,
    pub anchor_count: usize,
    /// Upcoming entries whose neighborhoods are classified ahead of commit.
    pub lookahead: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            neighborhood_radius: 2,
            max_search_radius: 15,
            anchor_count: 3,
            lookahead: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchingConfig {
    pub title_threshold: f64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            title_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub attempts: u32,
    pub timeout_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout_ms: 30_000,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.attempts,
            timeout: Duration::from_millis(self.timeout_ms),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReviewConfig {
    pub max_fallback_ratio: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            max_fallback_ratio: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RenderConfig {
    pub dpi: u32,
    pub pdftoppm: String,
    pub pdfinfo: String,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            dpi: 150,
            pdftoppm: "pdftoppm".to_string(),
            pdfinfo: "pdfinfo".to_string(),
        }
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    #[default]
    Command,
    Replay,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifierConfig {
    pub kind: ClassifierKind,
    pub program: Option<String>,
    pub args: Vec<String>,
    pub replay_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub jobs: usize,
    pub book_timeout_secs: Option<u64>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            jobs: 2,
            book_timeout_secs: Some(1_800),
        }
    }
}

impl MappingConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file: {}", path.display()))?;
                toml::from_str::<MappingConfig>(&raw)
                    .with_context(|| format!("failed to parse config file: {}", path.display()))?
            }
            None => MappingConfig::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.search.anchor_count == 0 {
            bail!("search.anchor_count must be at least 1");
        }
        if self.search.lookahead == 0 {
            bail!("search.lookahead must be at least 1");
        }
        if self.search.max_search_radius < self.search.neighborhood_radius {
            bail!(
                "search.max_search_radius ({}) must not be smaller than search.neighborhood_radius ({})",
                self.search.max_search_radius,
                self.search.neighborhood_radius
            );
        }
        if !(self.matching.title_threshold > 0.0 && self.matching.title_threshold <= 1.0) {
            bail!(
                "matching.title_threshold must be in (0, 1], got {}",
                self.matching.title_threshold
            );
        }
        if self.retry.attempts == 0 {
            bail!("retry.attempts must be at least 1");
        }
        if self.retry.multiplier < 1.0 {
            bail!("retry.multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.review.max_fallback_ratio) {
            bail!("review.max_fallback_ratio must be in [0, 1]");
        }
        if self.render.dpi == 0 {
            bail!("render.dpi must be positive");
        }
        if self.batch.jobs == 0 {
            bail!("batch.jobs must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = MappingConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.search.neighborhood_radius, 2);
        assert_eq!(config.search.max_search_radius, 15);
        assert_eq!(config.review.max_fallback_ratio, 0.2);
        assert_eq!(config.classifier.kind, ClassifierKind::Command);
    }

    #[test]
    fn partial_toml_keeps_remaining_defaults() {
        let raw = r#"
            [search]
            lookahead = 8

            [retry]
            attempts = 5
            timeout_ms = 1000

            [classifier]
            kind = "replay"
            replay_path = "replies.json"
        "#;
        let config: MappingConfig = toml::from_str(raw).expect("valid toml");
        assert_eq!(config.search.lookahead, 8);
        assert_eq!(config.search.anchor_count, 3);
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.initial_backoff_ms, 500);
        assert_eq!(config.classifier.kind, ClassifierKind::Replay);
        assert_eq!(
            config.classifier.replay_path,
            Some(PathBuf::from("replies.json"))
        );

        let policy = config.retry.policy();
        assert_eq!(policy.timeout, Duration::from_millis(1000));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = "[search]\nneighbourhood = 3\n";
        assert!(toml::from_str::<MappingConfig>(raw).is_err());
    }

    #[test]
    fn validate_rejects_inverted_radii() {
        let mut config = MappingConfig::default();
        config.search.max_search_radius = 1;
        assert!(config.validate().is_err());
    }
}
