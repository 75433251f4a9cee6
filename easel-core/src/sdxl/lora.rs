//! Low-rank overlay weights fused into the base checkpoint at load time.
//!
//! Accepts the diffusers (`.lora.down` / `.lora.up`, `.lora_linear_layer.*`)
//! and PEFT (`.lora_A` / `.lora_B`) namings, each prefixed by the component
//! it targets. Every pair becomes `W += alpha / rank * up @ down`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Component {
    TextEncoder,
    TextEncoder2,
    Unet,
}

impl Component {
    pub const ALL: [Component; 3] = [Self::TextEncoder, Self::TextEncoder2, Self::Unet];

    pub fn dir(self) -> &'static str {
        match self {
            Self::TextEncoder => "text_encoder",
            Self::TextEncoder2 => "text_encoder_2",
            Self::Unet => "unet",
        }
    }

    fn strip(key: &str) -> Option<(Self, &str)> {
        // `text_encoder_2.` must be tried before its own prefix `text_encoder`.
        [Self::TextEncoder2, Self::TextEncoder, Self::Unet]
            .into_iter()
            .find_map(|c| {
                key.strip_prefix(c.dir())
                    .and_then(|rest| rest.strip_prefix('.'))
                    .map(|rest| (c, rest))
            })
    }
}

/// Weight files of the components an overlay can touch, plus the VAE.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentFiles {
    pub text_encoder: PathBuf,
    pub text_encoder_2: PathBuf,
    pub unet: PathBuf,
    pub vae: PathBuf,
}

impl ComponentFiles {
    fn get_mut(&mut self, component: Component) -> &mut PathBuf {
        match component {
            Component::TextEncoder => &mut self.text_encoder,
            Component::TextEncoder2 => &mut self.text_encoder_2,
            Component::Unet => &mut self.unet,
        }
    }
}

enum Part {
    Down,
    Up,
    Alpha,
}

const SUFFIXES: &[(&str, Part)] = &[
    (".lora.down.weight", Part::Down),
    (".lora.up.weight", Part::Up),
    (".lora_A.weight", Part::Down),
    (".lora_B.weight", Part::Up),
    (".lora_linear_layer.down.weight", Part::Down),
    (".lora_linear_layer.up.weight", Part::Up),
    (".alpha", Part::Alpha),
];

#[derive(Default)]
struct Layer {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f64>,
}

pub struct LoraWeights {
    layers: BTreeMap<(Component, String), Layer>,
}

impl LoraWeights {
    pub fn load(path: &Path) -> Result<Self> {
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("failed to read LoRA weights {}", path.display()))?;
        Self::from_tensors(tensors)
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut layers: BTreeMap<(Component, String), Layer> = BTreeMap::new();
        for (key, tensor) in tensors {
            let (component, rest) = Component::strip(&key)
                .ok_or_else(|| anyhow!("unsupported LoRA tensor name {key}"))?;
            let (module, part) = SUFFIXES
                .iter()
                .find_map(|(suffix, part)| rest.strip_suffix(suffix).map(|m| (m, part)))
                .ok_or_else(|| anyhow!("unsupported LoRA tensor name {key}"))?;
            let layer = layers.entry((component, module.to_string())).or_default();
            match part {
                Part::Down => layer.down = Some(tensor),
                Part::Up => layer.up = Some(tensor),
                Part::Alpha => {
                    let values = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
                    let alpha = values
                        .first()
                        .ok_or_else(|| anyhow!("empty alpha tensor {key}"))?;
                    layer.alpha = Some(*alpha as f64);
                }
            }
        }
        for ((component, module), layer) in &layers {
            if layer.down.is_none() || layer.up.is_none() {
                bail!(
                    "incomplete LoRA pair for {}.{module}",
                    component.dir()
                );
            }
        }
        Ok(Self { layers })
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn touches(&self, component: Component) -> bool {
        self.layers.keys().any(|(c, _)| *c == component)
    }

    /// Adds the overlay deltas for `component` into `base`, returning how many
    /// weights were updated.
    pub fn apply(&self, component: Component, base: &mut HashMap<String, Tensor>) -> Result<usize> {
        let mut updated = 0;
        for ((c, module), layer) in &self.layers {
            if *c != component {
                continue;
            }
            let (Some(down), Some(up)) = (&layer.down, &layer.up) else {
                continue;
            };
            let name = format!("{module}.weight");
            let weight = base.get(&name).ok_or_else(|| {
                anyhow!("LoRA targets {}.{name} which is not in the base weights", c.dir())
            })?;

            let rank = down.dim(0)?;
            let scale = layer.alpha.map_or(1.0, |alpha| alpha / rank as f64);
            let up = up.to_dtype(DType::F32)?.flatten_from(1)?;
            let down = down.to_dtype(DType::F32)?.flatten_from(1)?;
            let delta = up.matmul(&down)?;
            let out_features = weight.dims().first().copied().unwrap_or(0);
            let in_features = weight.elem_count().checked_div(out_features).unwrap_or(0);
            if delta.dims() != [out_features, in_features] {
                bail!(
                    "LoRA delta for {}.{name} has shape {:?}, base weight has {:?}",
                    c.dir(),
                    delta.shape(),
                    weight.shape()
                );
            }
            let delta = (delta.reshape(weight.shape())? * scale)?;
            let fused = (weight.to_dtype(DType::F32)? + delta)?.to_dtype(weight.dtype())?;
            base.insert(name, fused);
            updated += 1;
        }
        Ok(updated)
    }
}

/// Fuses the overlay into every component it touches and writes the result
/// under `work_dir`. Untouched components keep their original files.
pub fn fuse(lora_file: &Path, mut files: ComponentFiles, work_dir: &Path) -> Result<ComponentFiles> {
    let lora = LoraWeights::load(lora_file)?;
    if lora.is_empty() {
        bail!("{} contains no LoRA layers", lora_file.display());
    }
    info!(layers = lora.len(), file = %lora_file.display(), "fusing LoRA weights");

    for component in Component::ALL {
        if !lora.touches(component) {
            continue;
        }
        let source = files.get_mut(component);
        let mut tensors = candle_core::safetensors::load(&*source, &Device::Cpu)
            .with_context(|| format!("failed to read {}", source.display()))?;
        let updated = lora.apply(component, &mut tensors)?;

        let dir = work_dir.join("fused").join(component.dir());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let file_name = source
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", source.display()))?;
        let target = dir.join(file_name);
        candle_core::safetensors::save(&tensors, &target)
            .with_context(|| format!("failed to write {}", target.display()))?;
        debug!(component = component.dir(), updated, target = %target.display(), "fused component");
        *source = target;
    }
    Ok(files)
}
