use std::sync::Arc;

use crate::asset::Asset;
use crate::asset_key::{AssetId, AssetKey, AssetName};
use crate::job::{Job, JobDependencies};
use crate::logging;

pub type AssetLoader = Arc<dyn Fn(&AssetName) -> Option<Box<dyn Asset>> + Send + Sync + 'static>;

/// Runs an asset loader on a loading worker and keeps the result until the
/// manager takes it back on the main thread.
pub struct AsyncLoadAssetJob {
    asset_id: AssetId,
    key: AssetKey,
    loader: AssetLoader,
    priority: i32,
    loaded: Option<Box<dyn Asset>>,
    label: String,
}

impl AsyncLoadAssetJob {
    pub fn new(asset_id: AssetId, key: AssetKey, loader: AssetLoader, priority: i32) -> Self {
        let label = format!("load {}", key);
        Self {
            asset_id,
            key,
            loader,
            priority,
            loaded: None,
            label,
        }
    }

    pub fn asset_id(&self) -> AssetId {
        self.asset_id
    }

    pub fn key(&self) -> &AssetKey {
        &self.key
    }

    pub fn take_loaded(&mut self) -> Option<Box<dyn Asset>> {
        self.loaded.take()
    }
}

impl Job for AsyncLoadAssetJob {
    fn execute(&mut self) {
        self.loaded = (self.loader)(self.key.name());
        if self.loaded.is_none() {
            logging::error(format!(
                "failed to load '{}' ({}): loader returned nothing",
                self.key.name(),
                self.key.asset_type().name()
            ));
        }
    }

    // The loaded data is registered by the manager once it takes the job back.
    fn complete(&mut self) -> bool {
        true
    }

    fn dependencies(&self) -> JobDependencies {
        JobDependencies::new().with_priority(self.priority)
    }

    fn needs_complete(&self) -> bool {
        true
    }

    fn delete_after_completion(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        &self.label
    }
}
