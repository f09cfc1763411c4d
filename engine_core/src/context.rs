use std::sync::Arc;

use crate::asset_manager::AssetManager;
use crate::asset_source::{AssetSource, FileSource};
use crate::config::{ConfigError, EngineConfig};
use crate::jobs::{JobError, JobSystem};
use crate::logging;
use crate::sprite_assets::register_builtin_loaders;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Jobs(#[from] JobError),
}

/// Owns the job system and the asset manager for one engine instance.
pub struct EngineContext {
    config: EngineConfig,
    jobs: Arc<JobSystem>,
    assets: AssetManager,
    frame: u64,
    shut_down: bool,
}

impl EngineContext {
    /// Builds a context; the built-in loaders read from `assets.content_root`
    /// when one is configured.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let source = config
            .assets
            .content_root
            .as_ref()
            .map(|root| Arc::new(FileSource::new(root)) as Arc<dyn AssetSource>);
        Self::build(config, source)
    }

    pub fn with_source(
        config: EngineConfig,
        source: Arc<dyn AssetSource>,
    ) -> Result<Self, EngineError> {
        Self::build(config, Some(source))
    }

    fn build(
        config: EngineConfig,
        source: Option<Arc<dyn AssetSource>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let jobs = Arc::new(JobSystem::new(config.jobs_config())?);
        let mut assets = AssetManager::new(Arc::clone(&jobs), config.asset_manager_config());
        match source {
            Some(source) => register_builtin_loaders(&mut assets, source),
            None => logging::debug("no content root configured; built-in loaders not registered"),
        }
        logging::info(format!("engine context ready ({:?} jobs)", jobs.mode()));
        Ok(Self {
            config,
            jobs,
            assets,
            frame: 0,
            shut_down: false,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<JobSystem> {
        &self.jobs
    }

    pub fn assets(&self) -> &AssetManager {
        &self.assets
    }

    pub fn assets_mut(&mut self) -> &mut AssetManager {
        &mut self.assets
    }

    pub fn frame_index(&self) -> u64 {
        self.frame
    }

    /// Per-frame housekeeping: drives pending asset loads. Returns how many
    /// assets finished this frame.
    pub fn begin_frame(&mut self) -> usize {
        self.frame += 1;
        self.assets.begin_frame()
    }

    /// Releases every asset, drains outstanding jobs and stops the workers.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.assets.shutdown();
        self.jobs.wait_for_all_jobs();
        self.jobs.shutdown();
        logging::info(format!("engine context shut down after {} frames", self.frame));
    }
}

impl Drop for EngineContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}
