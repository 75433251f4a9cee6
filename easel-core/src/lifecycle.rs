use std::sync::{
    atomic::{AtomicBool, Ordering},
    OnceLock,
};

use image::DynamicImage;
use tracing::info;

use crate::{Error, GenerationArgs, Loader, ModelConfig, Pipeline, Result};

/// Owns the loaded pipeline and the readiness flag probed by health checks.
///
/// The flag flips to true once, after the loader returned successfully, and
/// never goes back. Failed loads leave it false.
pub struct ModelLifecycleManager<P> {
    config: ModelConfig,
    pipeline: OnceLock<P>,
    ready: AtomicBool,
}

impl<P: Pipeline> ModelLifecycleManager<P> {
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            pipeline: OnceLock::new(),
            ready: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Loads the pipeline once. Later calls return immediately.
    pub async fn load<L>(&self) -> Result<()>
    where
        L: Loader<Pipeline = P>,
    {
        if self.is_ready() {
            return Ok(());
        }
        info!(model_id = %self.config.model_id, device = %self.config.device, "loading pipeline");
        let pipeline = L::load(&self.config).await?;
        // A concurrent load may have won the race, in which case ours is dropped.
        let _ = self.pipeline.set(pipeline);
        self.ready.store(true, Ordering::Release);
        info!(model_id = %self.config.model_id, "pipeline ready");
        Ok(())
    }

    pub fn pipeline(&self) -> Result<&P> {
        if !self.is_ready() {
            return Err(Error::NotReady);
        }
        self.pipeline.get().ok_or(Error::NotReady)
    }

    pub fn generate(&self, args: &GenerationArgs) -> Result<Vec<DynamicImage>> {
        Ok(self.pipeline()?.generate(args)?)
    }
}
