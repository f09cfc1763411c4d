use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::asset_manager::AssetManagerConfig;
use crate::job::NO_PRIORITY;
use crate::jobs::{JobsConfig, JobsMode};

pub const MAX_WORKERS_PER_CATEGORY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub jobs: JobsSection,
    pub assets: AssetsSection,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct JobsSection {
    pub mode: JobsMode,
    /// Defaults to one less than the available cores.
    pub general_workers: Option<usize>,
    pub loading_workers: usize,
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            mode: JobsMode::Threaded,
            general_workers: None,
            loading_workers: 2,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AssetsSection {
    /// Directory the built-in loaders read from. Without one no file loaders
    /// are registered.
    pub content_root: Option<PathBuf>,
    pub default_priority: i32,
}

impl EngineConfig {
    pub fn parse_toml(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses `path`. A relative `content_root` is taken relative
    /// to the config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse_toml(&text)?;
        if let (Some(root), Some(dir)) = (config.assets.content_root.take(), path.parent()) {
            let root = if root.is_relative() { dir.join(root) } else { root };
            config.assets.content_root = Some(root);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jobs.mode == JobsMode::Threaded {
            if self.jobs.general_workers == Some(0) {
                return Err(ConfigError::Invalid(
                    "jobs.general_workers must be at least 1".to_string(),
                ));
            }
            if self.jobs.loading_workers == 0 {
                return Err(ConfigError::Invalid(
                    "jobs.loading_workers must be at least 1".to_string(),
                ));
            }
        }
        let general = self.jobs.general_workers.unwrap_or(1);
        if general > MAX_WORKERS_PER_CATEGORY || self.jobs.loading_workers > MAX_WORKERS_PER_CATEGORY
        {
            return Err(ConfigError::Invalid(format!(
                "at most {} workers per category",
                MAX_WORKERS_PER_CATEGORY
            )));
        }
        if self.assets.default_priority < NO_PRIORITY {
            return Err(ConfigError::Invalid(format!(
                "assets.default_priority must be {} or a non-negative priority",
                NO_PRIORITY
            )));
        }
        if let Some(root) = &self.assets.content_root {
            if root.as_os_str().is_empty() {
                return Err(ConfigError::Invalid(
                    "assets.content_root must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn jobs_config(&self) -> JobsConfig {
        match self.jobs.mode {
            JobsMode::Inline => JobsConfig::inline(),
            JobsMode::Threaded => {
                let defaults = JobsConfig::default();
                JobsConfig::threaded(
                    self.jobs.general_workers.unwrap_or(defaults.general_workers),
                    self.jobs.loading_workers,
                )
            }
        }
    }

    pub fn asset_manager_config(&self) -> AssetManagerConfig {
        AssetManagerConfig {
            default_priority: self.assets.default_priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = EngineConfig::parse_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.jobs.mode, JobsMode::Threaded);
        assert_eq!(config.jobs_config().loading_workers, 2);
        assert_eq!(config.asset_manager_config().default_priority, 0);
    }

    #[test]
    fn parses_full_config() {
        let text = r#"
            [jobs]
            mode = "inline"
            loading_workers = 3

            [assets]
            content_root = "content"
            default_priority = 4
        "#;
        let config = EngineConfig::parse_toml(text).unwrap();
        assert_eq!(config.jobs.mode, JobsMode::Inline);
        assert_eq!(config.jobs_config().mode, JobsMode::Inline);
        assert_eq!(config.assets.content_root, Some(PathBuf::from("content")));
        assert_eq!(config.asset_manager_config().default_priority, 4);
    }

    #[test]
    fn threaded_worker_counts_are_honored() {
        let config = EngineConfig::parse_toml(
            "[jobs]\nmode = \"threaded\"\ngeneral_workers = 3\nloading_workers = 1\n",
        )
        .unwrap();
        let jobs = config.jobs_config();
        assert_eq!((jobs.general_workers, jobs.loading_workers), (3, 1));
    }

    #[test]
    fn rejects_invalid_values() {
        let err = EngineConfig::parse_toml("[jobs]\nloading_workers = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        let err = EngineConfig::parse_toml("[assets]\ndefault_priority = -5\n").unwrap_err();
        assert!(err.to_string().contains("default_priority"));
        let err = EngineConfig::parse_toml("[jobs]\nmode = \"sometimes\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn load_resolves_content_root_next_to_file() {
        let dir = std::env::temp_dir().join(format!("engine_config_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine.toml");
        fs::write(&path, "[assets]\ncontent_root = \"content\"\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.assets.content_root, Some(dir.join("content")));

        let missing = EngineConfig::load(&dir.join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
        let _ = fs::remove_dir_all(&dir);
    }
}
