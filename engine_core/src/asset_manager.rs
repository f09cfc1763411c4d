use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::asset::{downcast_asset, Asset, AssetState, LoadProgress};
use crate::asset_key::{AssetId, AssetIdAllocator, AssetKey, AssetName, AssetNameError, AssetType};
use crate::downcast::AsAny;
use crate::job::JobId;
use crate::jobs::JobSystem;
use crate::load_job::{AssetLoader, AsyncLoadAssetJob};
use crate::logging;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssetManagerConfig {
    /// Priority used by [`AssetManager::request`], including nested loads.
    pub default_priority: i32,
}

impl Default for AssetManagerConfig {
    fn default() -> Self {
        Self {
            default_priority: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AssetError {
    #[error("no loader registered for {asset_type} (requested '{name}')")]
    LoaderNotFound {
        name: String,
        asset_type: &'static str,
    },
    #[error("failed to load {name}: {reason}")]
    FailedToLoad { name: String, reason: String },
    #[error("{id} is a {actual}, not a {requested}")]
    TypeMismatch {
        id: AssetId,
        requested: &'static str,
        actual: &'static str,
    },
    #[error("asset manager is disabled; {name} not loaded")]
    Disabled { name: String },
    #[error("invalid asset name '{name}': {source}")]
    InvalidName {
        name: String,
        #[source]
        source: AssetNameError,
    },
    #[error("unknown {0}")]
    Unknown(AssetId),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssetTelemetry {
    pub loaded: usize,
    pub futures: usize,
    pub loads_posted: u64,
    pub loads_completed: u64,
    pub failures: u64,
    pub cancelled: u64,
    pub abandoned: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FutureSnapshot {
    pub id: AssetId,
    pub key: String,
    pub priority: i32,
    pub awaiting_sub_loads: bool,
}

struct LoadedAsset {
    key: AssetKey,
    asset: Box<dyn Asset>,
}

enum FutureStage {
    Loading { job_id: JobId },
    AwaitingSubLoads { asset: Box<dyn Asset> },
}

struct FutureAsset {
    key: AssetKey,
    priority: i32,
    stage: FutureStage,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PollOutcome {
    Pending,
    Loaded,
    Failed,
}

#[derive(Default)]
struct Counters {
    loads_posted: u64,
    loads_completed: u64,
    failures: u64,
    cancelled: u64,
    abandoned: u64,
}

/// Keyed, ref-counted asset cache.
///
/// Every `(name, type)` pair maps to one [`AssetId`] for as long as somebody
/// holds a reference. Loads run as [`AsyncLoadAssetJob`]s on the loading
/// queue; [`AssetManager::begin_frame`] finishes them on the owning thread.
pub struct AssetManager {
    jobs: Arc<JobSystem>,
    ids: Arc<AssetIdAllocator>,
    config: AssetManagerConfig,
    loaders: HashMap<AssetType, AssetLoader>,
    ids_by_key: HashMap<AssetKey, AssetId>,
    keys_by_id: HashMap<AssetId, AssetKey>,
    loaded: HashMap<AssetId, LoadedAsset>,
    futures: BTreeMap<AssetId, FutureAsset>,
    ref_counts: HashMap<AssetId, u32>,
    enabled: bool,
    last_error: Option<AssetError>,
    counters: Counters,
}

impl AssetManager {
    pub fn new(jobs: Arc<JobSystem>, config: AssetManagerConfig) -> Self {
        Self::with_id_allocator(jobs, config, Arc::new(AssetIdAllocator::new()))
    }

    pub fn with_id_allocator(
        jobs: Arc<JobSystem>,
        config: AssetManagerConfig,
        ids: Arc<AssetIdAllocator>,
    ) -> Self {
        Self {
            jobs,
            ids,
            config,
            loaders: HashMap::new(),
            ids_by_key: HashMap::new(),
            keys_by_id: HashMap::new(),
            loaded: HashMap::new(),
            futures: BTreeMap::new(),
            ref_counts: HashMap::new(),
            enabled: true,
            last_error: None,
            counters: Counters::default(),
        }
    }

    pub fn jobs(&self) -> &Arc<JobSystem> {
        &self.jobs
    }

    pub fn config(&self) -> AssetManagerConfig {
        self.config
    }

    pub fn default_priority(&self) -> i32 {
        self.config.default_priority
    }

    /// Installs the loader for `T`, replacing any previous one. Loaders run on
    /// loading workers (or inline for synchronous loads).
    pub fn register_loader<T, F>(&mut self, loader: F)
    where
        T: Asset,
        F: Fn(&AssetName) -> Option<T> + Send + Sync + 'static,
    {
        let erased: AssetLoader = Arc::new(move |name: &AssetName| {
            loader(name).map(|asset| Box::new(asset) as Box<dyn Asset>)
        });
        let ty = AssetType::of::<T>();
        if self.loaders.insert(ty, erased).is_some() {
            logging::debug(format!("replaced loader for {}", ty.name()));
        }
    }

    pub fn has_loader<T: Asset>(&self) -> bool {
        self.loaders.contains_key(&AssetType::of::<T>())
    }

    /// Loads `name` on the calling thread. An in-flight load of the same key
    /// is cancelled and redone here if no worker picked it up yet, otherwise
    /// it is waited for.
    pub fn load_synchronous<T: Asset>(&mut self, name: &str) -> AssetId {
        let Some(key) = self.make_key::<T>(name) else {
            return AssetId::INVALID;
        };
        if let Some(&id) = self.ids_by_key.get(&key) {
            if self.futures.contains_key(&id) {
                self.resolve_now(id);
            } else if !self.loaded.contains_key(&id) {
                self.report(AssetError::FailedToLoad {
                    name: key.to_string(),
                    reason: "asset is still completing further up the stack".to_string(),
                });
            }
            if self.loaded.contains_key(&id) {
                self.add_ref(id);
                return id;
            }
            return AssetId::INVALID;
        }
        if !self.enabled {
            self.report(AssetError::Disabled {
                name: key.to_string(),
            });
            return AssetId::INVALID;
        }
        let Some(loader) = self.loader_for(&key) else {
            return AssetId::INVALID;
        };

        let id = self.ids.allocate();
        self.ids_by_key.insert(key.clone(), id);
        self.keys_by_id.insert(id, key.clone());
        if !self.finish_sync_load(id, key, &loader) {
            return AssetId::INVALID;
        }
        self.ref_counts.insert(id, 1);
        id
    }

    /// Starts loading `name` on the loading queue and returns its id right
    /// away. Requests for a key that is already loading or loaded share the
    /// existing id.
    pub fn async_load<T: Asset>(&mut self, name: &str, priority: i32) -> AssetId {
        let Some(key) = self.make_key::<T>(name) else {
            return AssetId::INVALID;
        };
        if let Some(&id) = self.ids_by_key.get(&key) {
            self.add_ref(id);
            return id;
        }
        if !self.enabled {
            self.report(AssetError::Disabled {
                name: key.to_string(),
            });
            return AssetId::INVALID;
        }
        let Some(loader) = self.loader_for(&key) else {
            return AssetId::INVALID;
        };

        let id = self.ids.allocate();
        let job_id = self.post_load(id, key.clone(), loader, priority);
        if !job_id.is_valid() {
            self.report(AssetError::FailedToLoad {
                name: key.to_string(),
                reason: "job system is shut down".to_string(),
            });
            return AssetId::INVALID;
        }
        self.ids_by_key.insert(key.clone(), id);
        self.keys_by_id.insert(id, key.clone());
        self.futures.insert(
            id,
            FutureAsset {
                key,
                priority,
                stage: FutureStage::Loading { job_id },
            },
        );
        self.ref_counts.insert(id, 1);
        id
    }

    /// [`AssetManager::async_load`] at the configured default priority.
    pub fn request<T: Asset>(&mut self, name: &str) -> AssetId {
        self.async_load::<T>(name, self.config.default_priority)
    }

    /// Returns the asset if it is loaded. A pending load is polled once but
    /// never waited on.
    pub fn get<T: Asset>(&mut self, id: AssetId) -> Option<&T> {
        if self.futures.contains_key(&id) {
            self.poll_future(id, false);
        }
        let actual = self.loaded.get(&id)?.key.asset_type();
        let requested = AssetType::of::<T>();
        if actual != requested {
            self.report(AssetError::TypeMismatch {
                id,
                requested: requested.name(),
                actual: actual.name(),
            });
            return None;
        }
        self.peek::<T>(id)
    }

    /// Like [`AssetManager::get`] without polling.
    pub fn peek<T: Asset>(&self, id: AssetId) -> Option<&T> {
        self.loaded
            .get(&id)
            .and_then(|loaded| downcast_asset::<T>(&*loaded.asset))
    }

    /// Drops one reference. The last release resolves a pending load, calls
    /// `release_resources` and forgets the id.
    pub fn release(&mut self, id: AssetId) {
        let Some(count) = self.ref_counts.get_mut(&id) else {
            if id.is_valid() {
                logging::warn(format!("release of unknown {}", id));
            }
            return;
        };
        *count = count.saturating_sub(1);
        if *count > 0 {
            return;
        }
        self.ref_counts.remove(&id);

        if let Some(future) = self.futures.remove(&id) {
            self.discard_future(id, future);
        }
        if let Some(LoadedAsset { key, mut asset }) = self.loaded.remove(&id) {
            asset.release_resources(self);
            logging::debug(format!("unloaded {} ({})", key, id));
        }
        if let Some(key) = self.keys_by_id.remove(&id) {
            if self.ids_by_key.get(&key) == Some(&id) {
                self.ids_by_key.remove(&key);
            }
        }
    }

    /// Reloads a loaded asset under the same id and ref count. The old
    /// instance is released first and the id reads as a future until the new
    /// load completes.
    pub fn async_reload<T: Asset>(&mut self, id: AssetId, priority: i32) -> AssetId {
        if self.futures.contains_key(&id) {
            logging::warn(format!("reload of {} ignored; it is still loading", id));
            return AssetId::INVALID;
        }
        let Some(key) = self.loaded.get(&id).map(|loaded| loaded.key.clone()) else {
            self.report(AssetError::Unknown(id));
            return AssetId::INVALID;
        };
        let requested = AssetType::of::<T>();
        if key.asset_type() != requested {
            self.report(AssetError::TypeMismatch {
                id,
                requested: requested.name(),
                actual: key.asset_type().name(),
            });
            return AssetId::INVALID;
        }
        if !self.enabled {
            self.report(AssetError::Disabled {
                name: key.to_string(),
            });
            return AssetId::INVALID;
        }
        let Some(loader) = self.loader_for(&key) else {
            return AssetId::INVALID;
        };
        let Some(LoadedAsset { key, mut asset }) = self.loaded.remove(&id) else {
            return AssetId::INVALID;
        };
        asset.release_resources(self);
        drop(asset);

        let job_id = self.post_load(id, key.clone(), loader, priority);
        if !job_id.is_valid() {
            self.fail_future(id, &key, "job system is shut down");
            return AssetId::INVALID;
        }
        logging::debug(format!("reloading {} ({})", key, id));
        self.futures.insert(
            id,
            FutureAsset {
                key,
                priority,
                stage: FutureStage::Loading { job_id },
            },
        );
        id
    }

    /// Polls every in-flight load once. Returns how many finished loading.
    pub fn begin_frame(&mut self) -> usize {
        let ids: Vec<AssetId> = self.futures.keys().copied().collect();
        let mut completed = 0;
        for id in ids {
            if !self.futures.contains_key(&id) {
                continue;
            }
            if self.poll_future(id, false) == PollOutcome::Loaded {
                completed += 1;
            }
        }
        completed
    }

    /// Stops registering new results. Loads that finish afterwards are
    /// released and dropped.
    pub fn disable(&mut self) {
        if self.enabled {
            logging::debug("asset manager disabled");
        }
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Disables the manager, resolves every pending load and releases every
    /// loaded asset exactly once.
    pub fn shutdown(&mut self) {
        self.disable();
        let pending: Vec<AssetId> = self.futures.keys().copied().collect();
        for id in pending {
            if let Some(future) = self.futures.remove(&id) {
                self.discard_future(id, future);
                self.counters.abandoned += 1;
            }
        }
        let mut loaded: Vec<AssetId> = self.loaded.keys().copied().collect();
        loaded.sort();
        for id in loaded.into_iter().rev() {
            if let Some(LoadedAsset { mut asset, .. }) = self.loaded.remove(&id) {
                asset.release_resources(self);
            }
        }
        self.ids_by_key.clear();
        self.keys_by_id.clear();
        self.ref_counts.clear();
    }

    pub fn asset_state(&self, id: AssetId) -> AssetState {
        if self.futures.contains_key(&id) {
            AssetState::Future
        } else if self.loaded.contains_key(&id) {
            AssetState::Loaded
        } else {
            AssetState::Unregistered
        }
    }

    pub fn ref_count(&self, id: AssetId) -> u32 {
        self.ref_counts.get(&id).copied().unwrap_or(0)
    }

    pub fn id_for<T: Asset>(&self, name: &str) -> Option<AssetId> {
        let name = AssetName::new(name).ok()?;
        self.ids_by_key.get(&AssetKey::of::<T>(name)).copied()
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    pub fn future_count(&self) -> usize {
        self.futures.len()
    }

    pub fn futures_snapshot(&self) -> Vec<FutureSnapshot> {
        self.futures
            .iter()
            .map(|(id, future)| FutureSnapshot {
                id: *id,
                key: future.key.to_string(),
                priority: future.priority,
                awaiting_sub_loads: matches!(future.stage, FutureStage::AwaitingSubLoads { .. }),
            })
            .collect()
    }

    pub fn telemetry(&self) -> AssetTelemetry {
        AssetTelemetry {
            loaded: self.loaded.len(),
            futures: self.futures.len(),
            loads_posted: self.counters.loads_posted,
            loads_completed: self.counters.loads_completed,
            failures: self.counters.failures,
            cancelled: self.counters.cancelled,
            abandoned: self.counters.abandoned,
        }
    }

    /// The most recent failure behind an `INVALID` id or a `None`.
    pub fn last_error(&self) -> Option<&AssetError> {
        self.last_error.as_ref()
    }

    fn make_key<T: Asset>(&mut self, name: &str) -> Option<AssetKey> {
        match AssetName::new(name) {
            Ok(name) => Some(AssetKey::of::<T>(name)),
            Err(source) => {
                self.report(AssetError::InvalidName {
                    name: name.to_string(),
                    source,
                });
                None
            }
        }
    }

    fn loader_for(&mut self, key: &AssetKey) -> Option<AssetLoader> {
        let loader = self.loaders.get(&key.asset_type()).cloned();
        if loader.is_none() {
            self.report(AssetError::LoaderNotFound {
                name: key.name().to_string(),
                asset_type: key.asset_type().name(),
            });
        }
        loader
    }

    fn add_ref(&mut self, id: AssetId) {
        *self.ref_counts.entry(id).or_insert(0) += 1;
    }

    fn report(&mut self, error: AssetError) {
        match &error {
            AssetError::Disabled { .. } => logging::warn(error.to_string()),
            AssetError::FailedToLoad { .. } => {
                self.counters.failures += 1;
                logging::error(error.to_string());
            }
            _ => logging::error(error.to_string()),
        }
        self.last_error = Some(error);
    }

    fn post_load(&mut self, id: AssetId, key: AssetKey, loader: AssetLoader, priority: i32) -> JobId {
        let job = AsyncLoadAssetJob::new(id, key, loader, priority);
        let job_id = self.jobs.post_loading_job(Box::new(job));
        if job_id.is_valid() {
            self.counters.loads_posted += 1;
        }
        job_id
    }

    fn take_loaded(&self, job_id: JobId) -> Option<Box<dyn Asset>> {
        let job = self.jobs.take_job(job_id)?;
        let mut job = job.into_any().downcast::<AsyncLoadAssetJob>().ok()?;
        job.take_loaded()
    }

    fn finish_sync_load(&mut self, id: AssetId, key: AssetKey, loader: &AssetLoader) -> bool {
        let Some(mut asset) = loader(key.name()) else {
            self.fail_future(id, &key, "loader produced no asset");
            return false;
        };
        match asset.complete_sync_load(self) {
            LoadProgress::Ready => {
                self.counters.loads_completed += 1;
                logging::debug(format!("loaded {} ({}) synchronously", key, id));
                self.loaded.insert(id, LoadedAsset { key, asset });
                true
            }
            progress => {
                asset.release_resources(self);
                let reason = if progress == LoadProgress::Pending {
                    "synchronous completion cannot wait on other loads"
                } else {
                    "completion failed"
                };
                self.fail_future(id, &key, reason);
                false
            }
        }
    }

    // Cancel-and-load-here if the job is still queued, otherwise wait for it.
    fn resolve_now(&mut self, id: AssetId) {
        let queued_job = match self.futures.get(&id).map(|future| &future.stage) {
            Some(FutureStage::Loading { job_id }) => Some(*job_id),
            Some(FutureStage::AwaitingSubLoads { .. }) => None,
            None => return,
        };
        if let Some(job_id) = queued_job {
            if self.jobs.try_cancel_loading_job(job_id) {
                let Some(future) = self.futures.remove(&id) else {
                    return;
                };
                self.counters.cancelled += 1;
                match self.loader_for(&future.key) {
                    Some(loader) => {
                        self.finish_sync_load(id, future.key, &loader);
                    }
                    None => self.forget_key(id, &future.key),
                }
                return;
            }
        }
        self.poll_future(id, true);
    }

    /// Advances one future through `Loading -> AwaitingSubLoads -> Loaded`.
    /// The future is out of the map while its asset runs completion code.
    fn poll_future(&mut self, id: AssetId, blocking: bool) -> PollOutcome {
        let Some(mut future) = self.futures.remove(&id) else {
            return if self.loaded.contains_key(&id) {
                PollOutcome::Loaded
            } else {
                PollOutcome::Failed
            };
        };
        loop {
            match future.stage {
                FutureStage::Loading { job_id } => {
                    if !self.jobs.complete_job(job_id, blocking) {
                        self.futures.insert(id, future);
                        return PollOutcome::Pending;
                    }
                    let Some(asset) = self.take_loaded(job_id) else {
                        if self.enabled {
                            self.fail_future(id, &future.key, "loader produced no asset");
                        } else {
                            self.abandon(id, &future.key, None);
                        }
                        return PollOutcome::Failed;
                    };
                    future.stage = FutureStage::AwaitingSubLoads { asset };
                }
                FutureStage::AwaitingSubLoads { mut asset } => {
                    if !self.enabled {
                        self.abandon(id, &future.key, Some(asset));
                        return PollOutcome::Failed;
                    }
                    match asset.complete_async_load(self) {
                        LoadProgress::Ready => {
                            self.counters.loads_completed += 1;
                            logging::debug(format!("loaded {} ({})", future.key, id));
                            self.loaded.insert(
                                id,
                                LoadedAsset {
                                    key: future.key,
                                    asset,
                                },
                            );
                            return PollOutcome::Loaded;
                        }
                        LoadProgress::Failed => {
                            asset.release_resources(self);
                            self.fail_future(id, &future.key, "completion failed");
                            return PollOutcome::Failed;
                        }
                        LoadProgress::Pending => {
                            future.stage = FutureStage::AwaitingSubLoads { asset };
                            if blocking && self.drive_other_futures(id) {
                                continue;
                            }
                            if blocking {
                                logging::warn(format!(
                                    "{} ({}) is waiting on loads that cannot finish",
                                    future.key, id
                                ));
                            }
                            self.futures.insert(id, future);
                            return PollOutcome::Pending;
                        }
                    }
                }
            }
        }
    }

    // Blocking helper for nested loads; true when any other future settled.
    fn drive_other_futures(&mut self, except: AssetId) -> bool {
        let others: Vec<AssetId> = self
            .futures
            .keys()
            .copied()
            .filter(|other| *other != except)
            .collect();
        let mut settled = false;
        for other in others {
            if self.poll_future(other, true) != PollOutcome::Pending {
                settled = true;
            }
        }
        settled
    }

    fn discard_future(&mut self, id: AssetId, future: FutureAsset) {
        let FutureAsset { key, stage, .. } = future;
        match stage {
            FutureStage::Loading { job_id } => {
                if self.jobs.try_cancel_loading_job(job_id) {
                    self.counters.cancelled += 1;
                    logging::debug(format!("cancelled load of {} ({})", key, id));
                    return;
                }
                self.jobs.complete_job(job_id, true);
                if let Some(mut asset) = self.take_loaded(job_id) {
                    asset.release_resources(self);
                }
            }
            FutureStage::AwaitingSubLoads { mut asset } => asset.release_resources(self),
        }
    }

    fn abandon(&mut self, id: AssetId, key: &AssetKey, asset: Option<Box<dyn Asset>>) {
        if let Some(mut asset) = asset {
            asset.release_resources(self);
        }
        self.forget_key(id, key);
        self.counters.abandoned += 1;
        logging::debug(format!("abandoned load of {} ({})", key, id));
    }

    fn fail_future(&mut self, id: AssetId, key: &AssetKey, reason: &str) {
        self.forget_key(id, key);
        self.report(AssetError::FailedToLoad {
            name: key.to_string(),
            reason: reason.to_string(),
        });
    }

    // A failed id stays known while references to it are outstanding so that
    // their releases balance; the key is freed for a fresh attempt.
    fn forget_key(&mut self, id: AssetId, key: &AssetKey) {
        if self.ids_by_key.get(key) == Some(&id) {
            self.ids_by_key.remove(key);
        }
        if !self.ref_counts.contains_key(&id) {
            self.keys_by_id.remove(&id);
        }
    }
}

impl Drop for AssetManager {
    fn drop(&mut self) {
        if !self.loaded.is_empty() || !self.futures.is_empty() {
            self.shutdown();
        }
    }
}
