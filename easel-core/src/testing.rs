//! Stand-in pipelines for adapter tests.

use std::sync::Mutex;

use anyhow::bail;
use image::{DynamicImage, Rgb, RgbImage};

use crate::{GenerationArgs, Loader, ModelConfig, Pipeline};

/// Returns solid images and records every call.
///
/// The red channel of the n-th image is `n`, so callers can check ordering.
pub struct SolidPipeline {
    width: u32,
    height: u32,
    calls: Mutex<Vec<GenerationArgs>>,
}

impl SolidPipeline {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<GenerationArgs> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn image(&self, index: usize) -> DynamicImage {
        let pixel = Rgb([index as u8, 128, 255]);
        DynamicImage::ImageRgb8(RgbImage::from_pixel(self.width, self.height, pixel))
    }
}

impl Pipeline for SolidPipeline {
    fn generate(&self, args: &GenerationArgs) -> anyhow::Result<Vec<DynamicImage>> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(args.clone());
        }
        Ok((0..args.image_count()).map(|i| self.image(i)).collect())
    }
}

/// Fails every call, as a pipeline whose kernels error out would.
pub struct FailingPipeline;

impl Pipeline for FailingPipeline {
    fn generate(&self, _args: &GenerationArgs) -> anyhow::Result<Vec<DynamicImage>> {
        bail!("CUDA out of memory")
    }
}

/// Loads a 1x1 [`SolidPipeline`].
pub struct SolidLoader;

impl Loader for SolidLoader {
    type Pipeline = SolidPipeline;

    async fn load(_config: &ModelConfig) -> anyhow::Result<SolidPipeline> {
        Ok(SolidPipeline::new(1, 1))
    }
}

/// Fails to load, as a missing checkpoint would.
pub struct FailingLoader;

impl Loader for FailingLoader {
    type Pipeline = SolidPipeline;

    async fn load(config: &ModelConfig) -> anyhow::Result<SolidPipeline> {
        bail!("no weights at {}", config.model_id)
    }
}
