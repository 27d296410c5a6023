//! Single ownership point for the shared loader machinery.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::debug;

use crate::domain::errors::{DownloadError, ImageResult};
use crate::domain::ports::NetworkPort;
use crate::infrastructure::config::LoaderConfig;
use crate::infrastructure::download::{HttpTransport, MergeRequestDownloader};
use crate::infrastructure::image::{AnimatedImage, CoderRegistry};
use crate::infrastructure::queue_pool::QueuePool;

/// Errors raised while assembling a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A worker lane thread could not be spawned.
    #[error("failed to start worker lanes: {0}")]
    WorkerSpawn(#[from] std::io::Error),

    /// The HTTP transport could not be built.
    #[error("failed to create transport: {0}")]
    Transport(#[from] DownloadError),
}

/// Coder registry, worker pools and downloader built from one
/// [`LoaderConfig`].
pub struct ImagePipeline {
    config: LoaderConfig,
    registry: Arc<CoderRegistry>,
    decode_pool: Arc<QueuePool>,
    download_pool: Arc<QueuePool>,
    downloader: Arc<MergeRequestDownloader>,
}

impl ImagePipeline {
    /// Builds a pipeline fetching over HTTP on `runtime`.
    ///
    /// # Errors
    /// Returns error if worker lanes or the HTTP client cannot be created.
    pub fn new(config: LoaderConfig, runtime: Handle) -> Result<Self, PipelineError> {
        let transport = Arc::new(HttpTransport::new(runtime)?);
        Self::with_transport(config, transport)
    }

    /// Builds a pipeline fetching through `transport`.
    ///
    /// # Errors
    /// Returns error if worker lanes cannot be created.
    pub fn with_transport(
        config: LoaderConfig,
        transport: Arc<dyn NetworkPort>,
    ) -> Result<Self, PipelineError> {
        let registry = Arc::new(CoderRegistry::with_default_coders());
        let decode_pool = Arc::new(QueuePool::new(
            "frameweave.decode",
            config.queue_pool.decode_lanes,
        )?);
        let download_pool = Arc::new(QueuePool::new(
            "frameweave.download",
            config.queue_pool.download_lanes,
        )?);
        let downloader = MergeRequestDownloader::new(
            transport,
            download_pool.clone(),
            Some(registry.clone()),
            &config.downloader,
        );

        debug!(
            decode_lanes = decode_pool.lane_count(),
            download_lanes = download_pool.lane_count(),
            max_downloads = downloader.max_concurrent_downloads(),
            budget = %config.frame_cache.budget,
            "Image pipeline ready"
        );

        Ok(Self {
            config,
            registry,
            decode_pool,
            download_pool,
            downloader,
        })
    }

    /// Opens an animated image with the configured cache budget.
    ///
    /// # Errors
    /// Returns error if no registered coder accepts `data` or it is
    /// malformed.
    pub fn animated_image(&self, data: Bytes) -> ImageResult<AnimatedImage> {
        let image = AnimatedImage::from_registry(data, &self.registry, self.decode_pool.clone())?;
        image.set_cache_budget(self.config.frame_cache.budget);
        Ok(image)
    }

    /// The merged downloader.
    #[must_use]
    pub const fn downloader(&self) -> &Arc<MergeRequestDownloader> {
        &self.downloader
    }

    /// The coder registry. Coders registered here are used by later calls.
    #[must_use]
    pub const fn registry(&self) -> &Arc<CoderRegistry> {
        &self.registry
    }

    /// Pool running frame decodes.
    #[must_use]
    pub const fn decode_pool(&self) -> &Arc<QueuePool> {
        &self.decode_pool
    }

    /// Pool running download work.
    #[must_use]
    pub const fn download_pool(&self) -> &Arc<QueuePool> {
        &self.download_pool
    }

    /// Configuration the pipeline was built from.
    #[must_use]
    pub const fn config(&self) -> &LoaderConfig {
        &self.config
    }
}

impl std::fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("registry", &self.registry)
            .field("decode_pool", &self.decode_pool)
            .field("download_pool", &self.download_pool)
            .field("downloader", &self.downloader)
            .finish_non_exhaustive()
    }
}
