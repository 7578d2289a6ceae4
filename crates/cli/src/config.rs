//! CLI configuration

use mailproof_common::client::MAX_CLIENT_RETRIES;
use mailproof_common::{Error, ImageFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// MailProof configuration, read from `config.toml` in the store directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailProofConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Screenshot defaults for new jobs
    pub screenshots: ScreenshotConfig,

    /// Report scoring
    pub scoring: ScoringConfig,

    /// Runtime settings
    pub runtime: RuntimeConfig,
}

impl Default for MailProofConfig {
    fn default() -> Self {
        Self {
            store_path: mailproof_common::default_store_path(),
            screenshots: ScreenshotConfig::default(),
            scoring: ScoringConfig::default(),
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenshotConfig {
    pub format: ImageFormat,

    /// Encoder quality for lossy formats
    pub quality: u8,

    /// Upper bound on per-screenshot retries, whatever a client asks for
    pub max_retries: u32,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            format: ImageFormat::Png,
            quality: 90,
            max_retries: MAX_CLIENT_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Similarity (percent) a screenshot needs to match its baseline
    pub similarity_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: mailproof_common::screenshot::DEFAULT_SIMILARITY_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Reported in test result metadata
    pub environment: String,

    /// Buffered worker events per job aggregator
    pub channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            channel_capacity: 64,
        }
    }
}

impl MailProofConfig {
    /// Load configuration from file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str::<Self>(&content)?
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> mailproof_common::Result<()> {
        if !(1..=100).contains(&self.screenshots.quality) {
            return Err(Error::InvalidConfig(format!(
                "screenshots.quality must be within 1..=100, got {}",
                self.screenshots.quality
            )));
        }
        if self.screenshots.max_retries > MAX_CLIENT_RETRIES {
            return Err(Error::InvalidConfig(format!(
                "screenshots.max_retries must be at most {}, got {}",
                MAX_CLIENT_RETRIES, self.screenshots.max_retries
            )));
        }
        let threshold = self.scoring.similarity_threshold;
        if !(0.0..=100.0).contains(&threshold) {
            return Err(Error::InvalidConfig(format!(
                "scoring.similarity_threshold must be within [0, 100], got {}",
                threshold
            )));
        }
        if self.runtime.channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "runtime.channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("mailproof.db")
    }
}

/// Default configuration file location
pub fn default_config_path() -> PathBuf {
    mailproof_common::default_store_path().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = MailProofConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, MailProofConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conf").join("config.toml");

        let mut config = MailProofConfig::default();
        config.store_path = dir.path().join("store");
        config.screenshots.format = ImageFormat::Webp;
        config.runtime.environment = "staging".to_string();
        config.save(&path).unwrap();

        let loaded = MailProofConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.db_path(), dir.path().join("store").join("mailproof.db"));
    }

    #[test]
    fn test_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[scoring]\nsimilarity_threshold = 90.0\n").unwrap();

        let config = MailProofConfig::load(&path).unwrap();
        assert_eq!(config.scoring.similarity_threshold, 90.0);
        assert_eq!(config.screenshots, ScreenshotConfig::default());
    }

    #[test]
    fn test_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[screenshots]\nmax_retries = 9\n").unwrap();
        assert!(MailProofConfig::load(&path).is_err());

        std::fs::write(&path, "[runtime]\nchannel_capacity = 0\n").unwrap();
        assert!(MailProofConfig::load(&path).is_err());
    }
}
