use std::future::Future;

use anyhow::Result;

use crate::{ModelConfig, Pipeline};

/// Materializes a [`Pipeline`] from a resolved configuration.
pub trait Loader {
    type Pipeline: Pipeline;

    fn load(config: &ModelConfig) -> impl Future<Output = Result<Self::Pipeline>> + Send
    where
        Self: Sized;
}
