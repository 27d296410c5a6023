//! Loader configuration.

pub mod app_config;

pub use app_config::{
    ConfigError, DownloaderConfig, FrameCacheConfig, LoaderConfig, LogLevel, QueuePoolConfig,
};
