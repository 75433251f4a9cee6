#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod args;
pub mod config;
pub mod device_map;
pub mod error;
pub mod lifecycle;
pub mod loader;
pub mod params;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod util;
pub mod weights;

mod sdxl;

pub use args::{GenerationArgs, SizeConditioning};
pub use config::*;
pub use device_map::*;
pub use error::{Error, Result};
use image::DynamicImage;
pub use lifecycle::ModelLifecycleManager;
pub use loader::*;
pub use params::{normalize, normalize_map, ParamMap, ParamValue};
pub use sdxl::{SdxlLoader, SdxlPipeline};
pub use util::*;

/// The generation pipeline as seen by the serving adapters.
///
/// One call yields `args.num_images_per_prompt` images per prompt in
/// `args.prompts`, grouped by prompt in the same order.
pub trait Pipeline: Send + Sync {
    fn generate(&self, args: &GenerationArgs) -> anyhow::Result<Vec<DynamicImage>>;
}
