use std::path::PathBuf;

use tracing::info;

use crate::{DevicePolicy, Error, Result};

pub const DEFAULT_MODEL_ID: &str = "/mnt/models";
pub const ENV_MODEL_ID: &str = "model_id";
pub const ENV_MODEL_LOCATION: &str = "model_location";
pub const ENV_LORA_LOCATION: &str = "model_lora_weights_location";

/// Values supplied explicitly by the operator, typically from the command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub model_id: Option<String>,
    pub lora_dir: Option<String>,
    pub device: Option<String>,
}

/// Precision of the weights materialized from the checkpoint.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Precision {
    #[default]
    Half,
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadOptions {
    pub precision: Precision,
    /// Checkpoint variant tag, selects `<name>.<variant>.safetensors`.
    pub variant: Option<String>,
    pub safety_checker: bool,
    pub use_flash_attn: bool,
    /// Where fused overlay weights are written. Defaults to a per-process
    /// directory so concurrent servers never share fused files.
    pub work_dir: PathBuf,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            precision: Precision::Half,
            variant: Some("fp16".to_string()),
            safety_checker: false,
            use_flash_attn: cfg!(feature = "flash-attn"),
            work_dir: std::env::temp_dir().join(format!("easel-{}", std::process::id())),
        }
    }
}

/// Everything needed to load the pipeline. Immutable once resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelConfig {
    pub model_id: String,
    pub lora_location: Option<String>,
    pub device: DevicePolicy,
    pub ordinal: usize,
    pub options: LoadOptions,
}

impl ModelConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            lora_location: None,
            device: DevicePolicy::default(),
            ordinal: 0,
            options: LoadOptions::default(),
        }
    }

    /// Merges overrides, environment and defaults, in that order of precedence.
    ///
    /// `env` is the environment lookup; empty values count as unset.
    pub fn resolve<F>(overrides: &ConfigOverrides, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |key: &str| env(key).filter(|v| !v.is_empty());
        let explicit = |v: &Option<String>| v.clone().filter(|v| !v.is_empty());

        let device = match explicit(&overrides.device) {
            Some(device) => device.parse::<DevicePolicy>().map_err(|_| {
                Error::configuration(format!(
                    "invalid device {device:?}, expected one of {}",
                    DevicePolicy::ACCEPTED.join(", ")
                ))
            })?,
            None => DevicePolicy::default(),
        };

        let model_id = explicit(&overrides.model_id)
            .or_else(|| env(ENV_MODEL_ID))
            .or_else(|| env(ENV_MODEL_LOCATION))
            .unwrap_or_else(|| DEFAULT_MODEL_ID.to_string());
        let lora_location = explicit(&overrides.lora_dir).or_else(|| env(ENV_LORA_LOCATION));

        info!(%model_id, ?lora_location, %device, "resolved model configuration");

        Ok(Self {
            model_id,
            lora_location,
            device,
            ordinal: 0,
            options: LoadOptions::default(),
        })
    }

    /// [`ModelConfig::resolve`] against the process environment.
    pub fn from_env(overrides: &ConfigOverrides) -> Result<Self> {
        Self::resolve(overrides, |key| std::env::var(key).ok())
    }

    pub fn with_lora(mut self, location: impl Into<String>) -> Self {
        self.lora_location = Some(location.into());
        self
    }

    pub fn with_device(mut self, device: DevicePolicy, ordinal: usize) -> Self {
        self.device = device;
        self.ordinal = ordinal;
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.options.work_dir = work_dir.into();
        self
    }
}
