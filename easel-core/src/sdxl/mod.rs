use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_transformers::models::stable_diffusion::{
    self,
    clip::{self, ClipTextTransformer},
    schedulers::Scheduler,
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

mod lora;

pub use lora::{fuse, Component, ComponentFiles, LoraWeights};

use crate::{
    select_best_device, tensor_to_image, weights::WeightSource, GenerationArgs, Loader,
    ModelConfig, Pipeline, Precision, Residency,
};

const VAE_SCALE: f64 = 0.13025;
const TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const TOKENIZER_2_REPO: &str = "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k";

struct ResidentModels {
    text_encoders: [Arc<ClipTextTransformer>; 2],
    unet: Arc<UNet2DConditionModel>,
    vae: Arc<AutoEncoderKL>,
}

/// Stable Diffusion XL text-to-image pipeline.
///
/// With an offloading policy the weights stay memory-mapped on the host and
/// each component is only materialized on the compute device while in use.
pub struct SdxlPipeline {
    clip_configs: [clip::Config; 2],
    default_size: (usize, usize),
    device: Device,
    dtype: DType,
    residency: Residency,
    use_flash_attn: bool,
    files: ComponentFiles,
    tokenizers: [Tokenizer; 2],
    resident: Option<ResidentModels>,
}

fn sdxl_config() -> StableDiffusionConfig {
    StableDiffusionConfig::sdxl(None, None, None)
}

impl SdxlPipeline {
    fn clip_config(&self, index: usize) -> &clip::Config {
        &self.clip_configs[index]
    }

    fn text_encoder(&self, index: usize) -> Result<Arc<ClipTextTransformer>> {
        if let Some(models) = &self.resident {
            return Ok(models.text_encoders[index].clone());
        }
        let file = match index {
            0 => &self.files.text_encoder,
            _ => &self.files.text_encoder_2,
        };
        let model = stable_diffusion::build_clip_transformer(
            self.clip_config(index),
            file,
            &self.device,
            DType::F32,
        )?;
        Ok(Arc::new(model))
    }

    fn unet(&self) -> Result<Arc<UNet2DConditionModel>> {
        if let Some(models) = &self.resident {
            return Ok(models.unet.clone());
        }
        let unet = sdxl_config().build_unet(
            &self.files.unet,
            &self.device,
            4,
            self.use_flash_attn,
            self.dtype,
        )?;
        Ok(Arc::new(unet))
    }

    fn vae(&self) -> Result<Arc<AutoEncoderKL>> {
        if let Some(models) = &self.resident {
            return Ok(models.vae.clone());
        }
        Ok(Arc::new(sdxl_config().build_vae(
            &self.files.vae,
            &self.device,
            DType::F32,
        )?))
    }

    fn tokenize(&self, index: usize, prompt: &str) -> Result<Tensor> {
        let tokenizer = &self.tokenizers[index];
        let config = self.clip_config(index);
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no {pad_token} token"))?;
        let mut tokens = tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let max_len = config.max_position_embeddings;
        if tokens.len() > max_len {
            warn!(len = tokens.len(), max_len, "prompt is too long, truncating");
            tokens.truncate(max_len);
        }
        tokens.resize(max_len, pad_id);
        Ok(Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?)
    }

    /// Concatenated embeddings of both text encoders, with the unconditional
    /// embedding stacked first when guidance is on. The second encoder reads
    /// `prompt_2` / `negative_prompt_2` when given.
    fn encode_prompts(&self, args: &GenerationArgs, guided: bool) -> Result<Vec<Tensor>> {
        let negative = args.negative_prompt.as_deref().unwrap_or("");
        let negative_2 = args.negative_prompt_2.as_deref().unwrap_or(negative);

        let mut per_encoder = Vec::with_capacity(2);
        for index in 0..2 {
            let encoder = self.text_encoder(index)?;
            let uncond = if guided {
                let negative = if index == 0 { negative } else { negative_2 };
                Some(encoder.forward(&self.tokenize(index, negative)?)?)
            } else {
                None
            };
            let mut embeddings = Vec::with_capacity(args.prompts.len());
            for prompt in &args.prompts {
                let prompt = match (index, &args.prompt_2) {
                    (1, Some(prompt_2)) => prompt_2.as_str(),
                    _ => prompt.as_str(),
                };
                let cond = encoder.forward(&self.tokenize(index, prompt)?)?;
                let embedding = match &uncond {
                    Some(uncond) => Tensor::cat(&[uncond, &cond], 0)?,
                    None => cond,
                };
                embeddings.push(embedding);
            }
            per_encoder.push(embeddings);
        }

        let second = per_encoder.pop().context("missing second encoder output")?;
        let first = per_encoder.pop().context("missing first encoder output")?;
        first
            .iter()
            .zip(second.iter())
            .map(|(a, b)| -> Result<Tensor> {
                Ok(Tensor::cat(&[a, b], D::Minus1)?.to_dtype(self.dtype)?)
            })
            .collect()
    }

    fn denoise(
        &self,
        embeddings: &Tensor,
        args: &GenerationArgs,
        height: usize,
        width: usize,
    ) -> Result<Tensor> {
        let guided = args.guidance_scale > 1.0;
        let mut scheduler = sdxl_config().build_scheduler(args.num_inference_steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let latents = Tensor::randn(0f32, 1f32, (1, 4, height / 8, width / 8), &self.device)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        let unet = match self.residency {
            Residency::PerStep => None,
            _ => Some(self.unet()?),
        };
        for (index, &timestep) in timesteps.iter().enumerate() {
            let step_unet = match &unet {
                Some(unet) => unet.clone(),
                None => self.unet()?,
            };
            let input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let noise_pred = step_unet.forward(&input, timestep as f64, embeddings)?;
            drop(step_unet);

            let noise_pred = if guided {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                let noise_pred = (uncond + ((text - uncond)? * args.guidance_scale)?)?;
                if args.guidance_rescale > 0.0 {
                    rescale_noise(&noise_pred, text, args.guidance_rescale)?
                } else {
                    noise_pred
                }
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), timestep, "denoising");
        }
        drop(unet);
        Ok(latents)
    }

    fn decode(&self, vae: &AutoEncoderKL, latents: &Tensor) -> Result<DynamicImage> {
        let latents = (latents.to_dtype(DType::F32)? / VAE_SCALE)?;
        let images = vae.decode(&latents)?;
        let images = ((images / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let images = (images.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        tensor_to_image(&images.i(0)?)
    }
}

impl Pipeline for SdxlPipeline {
    fn generate(&self, args: &GenerationArgs) -> Result<Vec<DynamicImage>> {
        let height = args.height.unwrap_or(self.default_size.0);
        let width = args.width.unwrap_or(self.default_size.1);
        if height % 8 != 0 || width % 8 != 0 {
            bail!("image dimensions have to be divisible by 8, got {height}x{width}");
        }
        if let Some(seed) = args.seed {
            // The CPU backend cannot be seeded; generation goes on unseeded.
            if let Err(e) = self.device.set_seed(seed) {
                warn!(seed, "failed to seed the device rng: {e}");
            }
        }
        if args.eta != 0.0 {
            debug!(eta = args.eta, "eta has no effect on this scheduler");
        }
        let guided = args.guidance_scale > 1.0;

        let embeddings = self.encode_prompts(args, guided)?;
        info!(prompts = args.prompts.len(), height, width, steps = args.num_inference_steps, "encoded prompts");

        let mut latents = Vec::with_capacity(args.image_count());
        for embedding in &embeddings {
            for _ in 0..args.num_images_per_prompt {
                latents.push(self.denoise(embedding, args, height, width)?);
            }
        }

        let vae = self.vae()?;
        let images = latents
            .iter()
            .map(|latents| self.decode(&vae, latents))
            .collect::<Result<Vec<_>>>()?;
        info!(images = images.len(), "generated images");
        Ok(images)
    }
}

fn std_dev(t: &Tensor) -> Result<f64> {
    let t = t.to_dtype(DType::F32)?.flatten_all()?;
    let var = t.broadcast_sub(&t.mean_all()?)?.sqr()?.mean_all()?;
    Ok(f64::from(var.sqrt()?.to_scalar::<f32>()?))
}

/// Rescales guided noise toward the spread of the text-conditioned noise,
/// countering over-exposure at high guidance scales.
fn rescale_noise(guided: &Tensor, text: &Tensor, factor: f64) -> Result<Tensor> {
    let guided_std = std_dev(guided)?;
    if guided_std == 0.0 {
        return Ok(guided.clone());
    }
    let ratio = std_dev(text)? / guided_std;
    Ok((guided * (factor * ratio + 1.0 - factor))?)
}

async fn load_tokenizer(
    source: &WeightSource,
    local_file: &str,
    api: &Api,
    fallback_repo: &str,
) -> Result<Tokenizer> {
    let file = match source.is_local() {
        true => source.find(local_file).await,
        false => None,
    };
    let file = match file {
        Some(file) => file,
        None => api
            .model(fallback_repo.to_string())
            .get("tokenizer.json")
            .await
            .with_context(|| format!("failed to get tokenizer from {fallback_repo}"))?,
    };
    Tokenizer::from_file(&file)
        .map_err(Error::msg)
        .with_context(|| format!("failed to load tokenizer {}", file.display()))
}

fn build_resident(
    sd_config: &StableDiffusionConfig,
    clip_configs: &[clip::Config; 2],
    files: &ComponentFiles,
    device: &Device,
    dtype: DType,
    use_flash_attn: bool,
) -> Result<ResidentModels> {
    let build_clip = |config: &clip::Config, file: &Path| {
        stable_diffusion::build_clip_transformer(config, file, device, DType::F32)
            .map(Arc::new)
            .with_context(|| format!("failed to build text encoder {}", file.display()))
    };
    let text_encoders = [
        build_clip(&clip_configs[0], &files.text_encoder)?,
        build_clip(&clip_configs[1], &files.text_encoder_2)?,
    ];
    let unet = sd_config
        .build_unet(&files.unet, device, 4, use_flash_attn, dtype)
        .context("failed to build unet")?;
    let vae = sd_config
        .build_vae(&files.vae, device, DType::F32)
        .context("failed to build vae")?;
    Ok(ResidentModels {
        text_encoders,
        unet: Arc::new(unet),
        vae: Arc::new(vae),
    })
}

pub struct SdxlLoader;

impl Loader for SdxlLoader {
    type Pipeline = SdxlPipeline;

    async fn load(config: &ModelConfig) -> Result<Self::Pipeline> {
        let options = &config.options;
        if options.safety_checker {
            bail!("a content safety checker was requested but this pipeline has none");
        }
        warn!("content safety filter disabled by operator configuration");

        // Configure device.
        let device = select_best_device(config.device.device_map(config.ordinal))
            .context("failed to set up device")?;
        let dtype = match options.precision {
            Precision::Half if !device.is_cpu() => DType::F16,
            _ => DType::F32,
        };
        let residency = config.device.residency();
        info!(device = ?device, ?dtype, ?residency, "device placement");

        // --- Locate checkpoint files ---
        let api = Api::new()?;
        let source = WeightSource::resolve(&api, &config.model_id);
        let variant = options.variant.as_deref();
        let mut files = ComponentFiles {
            text_encoder: source.component("text_encoder", "model", variant).await?,
            text_encoder_2: source.component("text_encoder_2", "model", variant).await?,
            unet: source
                .component("unet", "diffusion_pytorch_model", variant)
                .await?,
            vae: source
                .component("vae", "diffusion_pytorch_model", variant)
                .await?,
        };
        let tokenizers = [
            load_tokenizer(&source, "tokenizer/tokenizer.json", &api, TOKENIZER_REPO).await?,
            load_tokenizer(&source, "tokenizer_2/tokenizer.json", &api, TOKENIZER_2_REPO).await?,
        ];

        // --- Overlay weights ---
        if let Some(location) = &config.lora_location {
            info!(%location, "loading LoRA weights");
            let lora_file = WeightSource::resolve(&api, location)
                .lora_file()
                .await
                .with_context(|| format!("failed to locate LoRA weights at {location}"))?;
            files = fuse(&lora_file, files, &options.work_dir)
                .with_context(|| format!("failed to apply LoRA weights from {location}"))?;
            info!(%location, "loaded LoRA weights");
        }

        let sd_config = sdxl_config();
        let clip_configs = [
            sd_config.clip.clone(),
            sd_config
                .clip2
                .clone()
                .context("sdxl config has no second text encoder")?,
        ];
        let resident = match residency {
            Residency::Resident => Some(build_resident(
                &sd_config,
                &clip_configs,
                &files,
                &device,
                dtype,
                options.use_flash_attn,
            )?),
            Residency::PerStage | Residency::PerStep => None,
        };

        Ok(SdxlPipeline {
            clip_configs,
            default_size: (sd_config.height, sd_config.width),
            device,
            dtype,
            residency,
            use_flash_attn: options.use_flash_attn,
            files,
            tokenizers,
            resident,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_pulls_guided_noise_to_the_text_spread() {
        let text = Tensor::new(&[1f32, -1., 1., -1.], &Device::Cpu).unwrap();
        let guided = Tensor::new(&[4f32, -4., 4., -4.], &Device::Cpu).unwrap();

        let full = rescale_noise(&guided, &text, 1.0).unwrap();
        assert_eq!(full.to_vec1::<f32>().unwrap(), vec![1., -1., 1., -1.]);

        let none = rescale_noise(&guided, &text, 0.0).unwrap();
        assert_eq!(none.to_vec1::<f32>().unwrap(), vec![4., -4., 4., -4.]);
    }

    #[test]
    fn flat_noise_is_left_alone() {
        let flat = Tensor::zeros(4, DType::F32, &Device::Cpu).unwrap();
        let text = Tensor::new(&[1f32, -1., 1., -1.], &Device::Cpu).unwrap();
        let out = rescale_noise(&flat, &text, 0.7).unwrap();
        assert_eq!(out.to_vec1::<f32>().unwrap(), vec![0.; 4]);
    }
}
