use anyhow::{anyhow, bail, Result};
use tracing::debug;

use crate::params::{ParamMap, ParamValue};

pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
pub const DEFAULT_STEPS: usize = 30;

/// Micro-conditioning pairs of SDXL, as `(height, width)` or `(top, left)`.
///
/// Bound and validated but not fed to the model: the candle UNet has no added
/// time embeddings to carry them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SizeConditioning {
    pub original_size: Option<(usize, usize)>,
    pub crops_coords_top_left: Option<(usize, usize)>,
    pub target_size: Option<(usize, usize)>,
}

impl SizeConditioning {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Arguments of one pipeline call.
///
/// Produces `num_images_per_prompt` images per prompt, grouped by prompt.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationArgs {
    pub prompts: Vec<String>,
    /// Prompt for the second text encoder; `prompts` when unset.
    pub prompt_2: Option<String>,
    pub negative_prompt: Option<String>,
    pub negative_prompt_2: Option<String>,
    pub num_images_per_prompt: usize,
    pub guidance_scale: f64,
    pub guidance_rescale: f64,
    pub num_inference_steps: usize,
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub seed: Option<u64>,
    /// Only meaningful for DDIM sampling; accepted and ignored.
    pub eta: f64,
    pub conditioning: SizeConditioning,
}

impl Default for GenerationArgs {
    fn default() -> Self {
        Self {
            prompts: Vec::new(),
            prompt_2: None,
            negative_prompt: None,
            negative_prompt_2: None,
            num_images_per_prompt: 1,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            guidance_rescale: 0.0,
            num_inference_steps: DEFAULT_STEPS,
            height: None,
            width: None,
            seed: None,
            eta: 0.0,
            conditioning: SizeConditioning::default(),
        }
    }
}

impl GenerationArgs {
    pub fn new(prompts: Vec<String>) -> Self {
        Self {
            prompts,
            ..Default::default()
        }
    }

    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    pub fn with_steps(mut self, steps: usize) -> Self {
        self.num_inference_steps = steps;
        self
    }

    pub fn with_size(mut self, height: usize, width: usize) -> Self {
        self.height = Some(height);
        self.width = Some(width);
        self
    }

    /// Number of images one call produces.
    pub fn image_count(&self) -> usize {
        self.prompts.len() * self.num_images_per_prompt
    }

    /// Binds named parameters the way keyword arguments bind to the pipeline.
    ///
    /// Unknown names, mistyped values and tuples of the wrong arity are
    /// rejected; `null` leaves the default in place.
    pub fn bind(params: &ParamMap) -> Result<Self> {
        let mut args = Self::default();

        for (name, value) in params {
            if *value == ParamValue::Null {
                continue;
            }
            match name.as_str() {
                "prompt" => args.prompts = prompts(value)?,
                "prompt_2" => args.prompt_2 = Some(string(name, value)?),
                "negative_prompt" => args.negative_prompt = Some(string(name, value)?),
                "negative_prompt_2" => args.negative_prompt_2 = Some(string(name, value)?),
                "num_images_per_prompt" => args.num_images_per_prompt = positive(name, value)?,
                "guidance_scale" => args.guidance_scale = number(name, value)?,
                "guidance_rescale" => args.guidance_rescale = number(name, value)?,
                "eta" => args.eta = number(name, value)?,
                "num_inference_steps" => args.num_inference_steps = positive(name, value)?,
                "height" => args.height = Some(positive(name, value)?),
                "width" => args.width = Some(positive(name, value)?),
                "original_size" => {
                    args.conditioning.original_size = Some(pair(name, value, positive)?)
                }
                "crops_coords_top_left" => {
                    args.conditioning.crops_coords_top_left = Some(pair(name, value, offset)?)
                }
                "target_size" => args.conditioning.target_size = Some(pair(name, value, positive)?),
                "seed" => {
                    args.seed = Some(
                        value
                            .as_u64()
                            .ok_or_else(|| mistyped(name, "a non-negative integer", value))?,
                    )
                }
                _ => bail!("pipeline got an unexpected keyword argument '{name}'"),
            }
        }

        if args.prompts.is_empty() {
            bail!("pipeline is missing the required argument 'prompt'");
        }
        if !(0.0..=1.0).contains(&args.guidance_rescale) {
            bail!("'guidance_rescale' must be within [0, 1], got {}", args.guidance_rescale);
        }
        if !args.conditioning.is_empty() {
            debug!(conditioning = ?args.conditioning, "size conditioning bound but not applied");
        }
        for (name, size) in [("height", args.height), ("width", args.width)] {
            if let Some(size) = size {
                if size % 8 != 0 {
                    bail!("'{name}' has to be divisible by 8 but is {size}");
                }
            }
        }
        Ok(args)
    }
}

fn mistyped(name: &str, expected: &str, value: &ParamValue) -> anyhow::Error {
    anyhow!("'{name}' must be {expected}, got {}", value.kind())
}

fn string(name: &str, value: &ParamValue) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| mistyped(name, "a string", value))
}

fn prompts(value: &ParamValue) -> Result<Vec<String>> {
    match value {
        ParamValue::Tuple(items) => items.iter().map(|item| string("prompt", item)).collect(),
        _ => Ok(vec![string("prompt", value)?]),
    }
}

fn number(name: &str, value: &ParamValue) -> Result<f64> {
    value.as_f64().ok_or_else(|| mistyped(name, "a number", value))
}

fn positive(name: &str, value: &ParamValue) -> Result<usize> {
    match value.as_usize() {
        Some(v) if v > 0 => Ok(v),
        _ => Err(mistyped(name, "a positive integer", value)),
    }
}

fn offset(name: &str, value: &ParamValue) -> Result<usize> {
    value
        .as_usize()
        .ok_or_else(|| mistyped(name, "a non-negative integer", value))
}

fn pair<F>(name: &str, value: &ParamValue, item: F) -> Result<(usize, usize)>
where
    F: Fn(&str, &ParamValue) -> Result<usize>,
{
    match value.as_tuple() {
        Some([a, b]) => Ok((item(name, a)?, item(name, b)?)),
        Some(items) => bail!("'{name}' must have 2 elements, got {}", items.len()),
        None => Err(mistyped(name, "a 2-tuple", value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::normalize_map;
    use serde_json::{json, Value};

    fn bind(value: Value) -> Result<GenerationArgs> {
        let Value::Object(map) = value else { unreachable!() };
        GenerationArgs::bind(&normalize_map(map))
    }

    #[test]
    fn binds_prompt_with_defaults() {
        let args = bind(json!({"prompt": "x"})).unwrap();
        assert_eq!(args.prompts, vec!["x".to_string()]);
        assert_eq!(args.guidance_scale, DEFAULT_GUIDANCE_SCALE);
        assert_eq!(args.num_inference_steps, DEFAULT_STEPS);
        assert_eq!(args.height, None);
    }

    #[test]
    fn binds_sampling_parameters() {
        let args = bind(json!({
            "prompt": "x",
            "negative_prompt": "blurry",
            "guidance_scale": 5,
            "num_inference_steps": 12,
            "height": 768,
            "width": 1024,
            "seed": 42,
        }))
        .unwrap();
        assert_eq!(args.negative_prompt.as_deref(), Some("blurry"));
        assert_eq!(args.guidance_scale, 5.0);
        assert_eq!(args.num_inference_steps, 12);
        assert_eq!((args.height, args.width), (Some(768), Some(1024)));
        assert_eq!(args.seed, Some(42));
    }

    #[test]
    fn prompt_tuple_yields_several_prompts() {
        let args = bind(json!({"prompt": ["a", "b"]})).unwrap();
        assert_eq!(args.prompts, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn size_conditioning_never_changes_the_output_size() {
        let args = bind(json!({
            "prompt": "x",
            "original_size": [1024, 1024],
            "crops_coords_top_left": [0, 0],
            "target_size": [512, 640],
        }))
        .unwrap();
        assert_eq!((args.height, args.width), (None, None));
        assert_eq!(
            args.conditioning,
            SizeConditioning {
                original_size: Some((1024, 1024)),
                crops_coords_top_left: Some((0, 0)),
                target_size: Some((512, 640)),
            }
        );

        let args = bind(json!({"prompt": "x", "height": 256, "target_size": [512, 640]})).unwrap();
        assert_eq!((args.height, args.width), (Some(256), None));
    }

    #[test]
    fn binds_the_remaining_sdxl_arguments() {
        let args = bind(json!({
            "prompt": "x",
            "prompt_2": "y",
            "negative_prompt_2": "z",
            "num_images_per_prompt": 2,
            "guidance_rescale": 0.7,
            "eta": 0.1,
        }))
        .unwrap();
        assert_eq!(args.prompt_2.as_deref(), Some("y"));
        assert_eq!(args.negative_prompt_2.as_deref(), Some("z"));
        assert_eq!(args.num_images_per_prompt, 2);
        assert_eq!(args.image_count(), 2);
        assert_eq!(args.guidance_rescale, 0.7);
        assert_eq!(args.eta, 0.1);

        assert!(bind(json!({"prompt": "x", "guidance_rescale": 1.5})).is_err());
        assert!(bind(json!({"prompt": "x", "original_size": [0, 1024]})).is_err());
        assert!(bind(json!({"prompt": "x", "crops_coords_top_left": [-1, 0]})).is_err());
    }

    #[test]
    fn target_size_needs_two_elements() {
        let err = bind(json!({"prompt": "x", "target_size": [512]})).unwrap_err();
        assert!(err.to_string().contains("2 elements"));
    }

    #[test]
    fn rejects_unknown_arguments() {
        let err = bind(json!({"prompt": "x", "strength": 0.3})).unwrap_err();
        assert!(err.to_string().contains("strength"));
    }

    #[test]
    fn rejects_missing_prompt_and_bad_types() {
        assert!(bind(json!({"guidance_scale": 1.0})).is_err());
        assert!(bind(json!({"prompt": 3})).is_err());
        assert!(bind(json!({"prompt": "x", "num_inference_steps": 0})).is_err());
        assert!(bind(json!({"prompt": "x", "height": 100})).is_err());
    }

    #[test]
    fn null_keeps_defaults() {
        let args = bind(json!({"prompt": "x", "seed": null})).unwrap();
        assert_eq!(args.seed, None);
    }
}
