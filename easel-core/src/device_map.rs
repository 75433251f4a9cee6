use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Operator-selected placement for the pipeline weights.
///
/// The string forms are the values accepted by `--device`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DevicePolicy {
    /// Every component resident on the accelerator.
    #[default]
    #[serde(rename = "cuda")]
    Accelerator,
    #[serde(rename = "cpu")]
    Cpu,
    /// Whole components are moved onto the accelerator only for their stage.
    #[serde(rename = "enable_model_cpu_offload")]
    ModelCpuOffload,
    /// Like `ModelCpuOffload`, but the denoiser is released between steps.
    #[serde(rename = "enable_sequential_cpu_offload")]
    SequentialCpuOffload,
}

serde_plain::derive_fromstr_from_deserialize!(DevicePolicy);
serde_plain::derive_display_from_serialize!(DevicePolicy);

/// How long a component's weights stay on the compute device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    /// Built once at load, kept for the process lifetime.
    Resident,
    /// Built at the start of each pipeline stage, dropped at its end.
    PerStage,
    /// Built for every single forward call.
    PerStep,
}

impl DevicePolicy {
    pub const ACCEPTED: &'static [&'static str] = &[
        "cuda",
        "cpu",
        "enable_model_cpu_offload",
        "enable_sequential_cpu_offload",
    ];

    pub fn device_map(self, ordinal: usize) -> DeviceMap {
        match self {
            Self::Cpu => DeviceMap::ForceCpu,
            _ => DeviceMap::Ordinal(ordinal),
        }
    }

    pub fn residency(self) -> Residency {
        match self {
            Self::Accelerator | Self::Cpu => Residency::Resident,
            Self::ModelCpuOffload => Residency::PerStage,
            Self::SequentialCpuOffload => Residency::PerStep,
        }
    }
}
