//! Configuration types and re-exports

pub use super::{
    AppConfig, CacheConfig, FeedConfig, KillzoneConfig, KillzoneWindowConfig, LoggingConfig,
    PipelineConfig,
};
