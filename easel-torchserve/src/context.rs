use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;

/// Deployment properties handed to the handler at initialization.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct SystemProperties {
    /// Directory holding the unpacked model archive.
    pub model_dir: Option<PathBuf>,
    #[serde(rename = "model-store")]
    pub model_store: Option<PathBuf>,
    /// Accelerator index assigned to this worker, if any.
    pub gpu_id: Option<usize>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Context {
    pub system_properties: SystemProperties,
    pub manifest: Value,
}

impl Context {
    pub fn new(system_properties: SystemProperties) -> Self {
        Self {
            system_properties,
            manifest: Value::Null,
        }
    }
}
