use crate::asset_manager::AssetManager;
use crate::downcast::AsAny;

/// Result of one completion poll.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadProgress {
    /// Waiting on something else (usually a nested load); poll again later.
    Pending,
    Ready,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetState {
    Unregistered,
    Future,
    Loaded,
}

impl AssetState {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetState::Unregistered => "unregistered",
            AssetState::Future => "future",
            AssetState::Loaded => "loaded",
        }
    }
}

/// Anything the [`AssetManager`] can cache.
///
/// Loaders build assets off the main thread. The completion hooks and
/// `release_resources` always run on the thread that owns the manager, so
/// they may touch thread-affine resources and issue nested loads.
pub trait Asset: AsAny + Send {
    fn complete_async_load(&mut self, _assets: &mut AssetManager) -> LoadProgress {
        LoadProgress::Ready
    }

    fn complete_sync_load(&mut self, _assets: &mut AssetManager) -> LoadProgress {
        LoadProgress::Ready
    }

    /// Called exactly once before the asset is dropped.
    fn release_resources(&mut self, _assets: &mut AssetManager) {}
}

pub(crate) fn downcast_asset<T: Asset>(asset: &dyn Asset) -> Option<&T> {
    asset.as_any().downcast_ref::<T>()
}
