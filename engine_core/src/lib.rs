#![forbid(unsafe_code)]

pub mod asset;
pub mod asset_key;
pub mod asset_manager;
pub mod asset_source;
pub mod config;
pub mod context;
pub mod downcast;
pub mod job;
pub mod job_graph;
pub mod jobs;
pub mod load_job;
pub mod logging;
pub mod observability;
pub mod sprite_assets;

pub use asset::{Asset, AssetState, LoadProgress};
pub use asset_key::{AssetId, AssetKey, AssetName};
pub use asset_manager::{AssetError, AssetManager, AssetManagerConfig};
pub use config::{ConfigError, EngineConfig};
pub use context::{EngineContext, EngineError};
pub use job::{FnJob, Job, JobDependencies, JobId, JobStatus};
pub use job_graph::JobGraph;
pub use jobs::{JobSystem, JobsConfig, JobsMode};
