use std::future::Future;
use std::marker::PhantomData;
use std::path::Path;

use anyhow::anyhow;
use easel_core::{
    accelerator_available, image_to_array, DevicePolicy, Error, GenerationArgs, ImageArray,
    Loader, ModelConfig, ModelLifecycleManager, Result,
};
use image::DynamicImage;
use serde_json::Value;
use tracing::{debug, info};

use crate::{archive::extract_archive, context::Context};

/// Pretrained base every deployment starts from, regardless of the archive.
pub const BASE_MODEL_ID: &str = "stabilityai/stable-diffusion-xl-base-1.0";
pub const ARCHIVE_NAME: &str = "model.zip";
pub const EXTRACT_DIR: &str = "model";

pub const GUIDANCE_SCALE: f64 = 7.5;
pub const INFERENCE_STEPS: usize = 50;
pub const IMAGE_SIZE: usize = 768;

/// Body of one request in a batch, as received from the frontend.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Bytes(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RequestEnvelope {
    pub body: RequestBody,
}

impl RequestEnvelope {
    pub fn json(body: Value) -> Self {
        Self {
            body: RequestBody::Json(body),
        }
    }

    pub fn bytes(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: RequestBody::Bytes(body.into()),
        }
    }
}

/// Batch handler lifecycle: initialize once, then preprocess, inference and
/// postprocess for every batch. Outputs line up with the input envelopes.
pub trait Handler {
    type Input;
    type Inference;
    type Output;

    fn initialize(&mut self, ctx: &Context) -> impl Future<Output = Result<()>> + Send;

    fn preprocess(&self, requests: &[RequestEnvelope]) -> Result<Vec<Self::Input>>;

    fn inference(&self, inputs: &[Self::Input]) -> Result<Vec<Self::Inference>>;

    fn postprocess(&self, inference_output: Vec<Self::Inference>) -> Result<Vec<Self::Output>>;

    fn handle(&self, requests: &[RequestEnvelope]) -> Result<Vec<Self::Output>> {
        let inputs = self.preprocess(requests)?;
        let outputs = self.inference(&inputs)?;
        self.postprocess(outputs)
    }
}

/// Text-to-image handler for model archives carrying LoRA weights.
pub struct DiffusersHandler<L: Loader> {
    manager: Option<ModelLifecycleManager<L::Pipeline>>,
    _loader: PhantomData<fn() -> L>,
}

impl<L: Loader> Default for DiffusersHandler<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Loader> DiffusersHandler<L> {
    pub fn new() -> Self {
        Self {
            manager: None,
            _loader: PhantomData,
        }
    }

    pub fn initialized(&self) -> bool {
        self.manager.as_ref().is_some_and(|m| m.is_ready())
    }

    pub fn config(&self) -> Option<&ModelConfig> {
        self.manager.as_ref().map(|m| m.config())
    }

    fn manager(&self) -> Result<&ModelLifecycleManager<L::Pipeline>> {
        self.manager.as_ref().ok_or(Error::NotReady)
    }
}

fn device_for(gpu_id: Option<usize>) -> (DevicePolicy, usize) {
    match gpu_id {
        Some(ordinal) if accelerator_available() => (DevicePolicy::Accelerator, ordinal),
        _ => (DevicePolicy::Cpu, 0),
    }
}

fn prompt_of(body: &RequestBody) -> Result<String> {
    let parsed;
    let tree = match body {
        RequestBody::Json(value) => value,
        RequestBody::Bytes(bytes) => {
            parsed = serde_json::from_slice::<Value>(bytes)
                .map_err(|e| Error::Pipeline(anyhow!("request body is not JSON: {e}")))?;
            &parsed
        }
    };
    let instance = tree
        .get("instances")
        .and_then(|instances| instances.get(0))
        .ok_or_else(|| Error::Pipeline(anyhow!("request body has no instances[0]")))?;

    match instance.get("data") {
        Some(Value::String(text)) => Ok(text.clone()),
        Some(Value::Array(items)) => {
            let bytes = items
                .iter()
                .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect::<Option<Vec<u8>>>()
                .ok_or_else(|| Error::invalid_input("data must be text or a byte array"))?;
            decode(bytes)
        }
        None | Some(Value::Null) => match body {
            RequestBody::Json(Value::String(text)) => Ok(text.clone()),
            RequestBody::Json(value) => Ok(value.to_string()),
            RequestBody::Bytes(bytes) => decode(bytes.clone()),
        },
        Some(_) => Err(Error::invalid_input("data must be text or a byte array")),
    }
}

fn decode(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| Error::Pipeline(anyhow!("prompt is not UTF-8: {e}")))
}

impl<L> Handler for DiffusersHandler<L>
where
    L: Loader + Send,
{
    type Input = String;
    type Inference = DynamicImage;
    type Output = ImageArray;

    async fn initialize(&mut self, ctx: &Context) -> Result<()> {
        let properties = &ctx.system_properties;
        let model_dir = properties
            .model_dir
            .as_deref()
            .ok_or_else(|| Error::configuration("system property model_dir is not set"))?;
        info!(model_dir = %model_dir.display(), model_store = ?properties.model_store, "initializing handler");

        let (device, ordinal) = device_for(properties.gpu_id);
        let extracted = model_dir.join(EXTRACT_DIR);
        extract_archive(&model_dir.join(ARCHIVE_NAME), &extracted)?;

        // The extracted archive only contributes the LoRA overlay; the base
        // pipeline always comes from the pretrained hub checkpoint.
        info!(model_id = BASE_MODEL_ID, "using pretrained base model");
        let config = ModelConfig::new(BASE_MODEL_ID)
            .with_device(device, ordinal)
            .with_lora(path_string(&extracted))
            .with_work_dir(model_dir.join(".easel"));

        let manager = ModelLifecycleManager::new(config);
        manager.load::<L>().await?;
        self.manager = Some(manager);
        Ok(())
    }

    fn preprocess(&self, requests: &[RequestEnvelope]) -> Result<Vec<String>> {
        requests
            .iter()
            .map(|request| {
                let text = prompt_of(&request.body)?;
                info!("Received text: '{text}'");
                Ok(text)
            })
            .collect()
    }

    fn inference(&self, inputs: &[String]) -> Result<Vec<DynamicImage>> {
        let args = GenerationArgs::new(inputs.to_vec())
            .with_guidance_scale(GUIDANCE_SCALE)
            .with_steps(INFERENCE_STEPS)
            .with_size(IMAGE_SIZE, IMAGE_SIZE);
        let images = self.manager()?.generate(&args)?;
        if images.len() != inputs.len() {
            return Err(Error::Pipeline(anyhow!(
                "pipeline returned {} images for {} prompts",
                images.len(),
                inputs.len()
            )));
        }
        debug!(images = images.len(), "generated images");
        Ok(images)
    }

    fn postprocess(&self, inference_output: Vec<DynamicImage>) -> Result<Vec<ImageArray>> {
        Ok(inference_output.iter().map(image_to_array).collect())
    }
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::tests::write_zip;
    use crate::context::SystemProperties;
    use easel_core::testing::{FailingLoader, SolidLoader};
    use serde_json::json;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> Context {
        write_zip(
            &dir.path().join(ARCHIVE_NAME),
            &[("pytorch_lora_weights.safetensors", "weights")],
        );
        Context::new(SystemProperties {
            model_dir: Some(dir.path().to_path_buf()),
            model_store: None,
            gpu_id: None,
        })
    }

    async fn initialized() -> (DiffusersHandler<SolidLoader>, TempDir) {
        let dir = TempDir::new().unwrap();
        let mut handler = DiffusersHandler::<SolidLoader>::new();
        handler.initialize(&context(&dir)).await.unwrap();
        (handler, dir)
    }

    fn envelope(data: Value) -> RequestEnvelope {
        RequestEnvelope::json(json!({"instances": [{"data": data}]}))
    }

    #[tokio::test]
    async fn initialize_extracts_and_layers_the_archive() {
        let (handler, dir) = initialized().await;
        assert!(handler.initialized());
        assert!(dir
            .path()
            .join("model/pytorch_lora_weights.safetensors")
            .is_file());

        let config = handler.config().unwrap();
        assert_eq!(config.model_id, BASE_MODEL_ID);
        assert_eq!(
            config.lora_location.as_deref(),
            Some(path_string(&dir.path().join("model")).as_str())
        );
    }

    #[test]
    fn without_a_gpu_id_the_handler_runs_on_cpu() {
        assert_eq!(device_for(None), (DevicePolicy::Cpu, 0));
    }

    #[tokio::test]
    async fn initialize_failures_leave_the_handler_uninitialized() {
        let mut handler = DiffusersHandler::<SolidLoader>::new();
        let err = handler
            .initialize(&Context::new(SystemProperties::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let dir = TempDir::new().unwrap();
        let mut handler = DiffusersHandler::<FailingLoader>::new();
        assert!(handler.initialize(&context(&dir)).await.is_err());
        assert!(!handler.initialized());
    }

    #[tokio::test]
    async fn missing_archive_is_fatal() {
        let dir = TempDir::new().unwrap();
        let mut handler = DiffusersHandler::<SolidLoader>::new();
        let ctx = Context::new(SystemProperties {
            model_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        });
        assert!(handler.initialize(&ctx).await.is_err());
        assert!(!handler.initialized());
    }

    #[tokio::test]
    async fn preprocess_keeps_order() {
        let (handler, _dir) = initialized().await;
        let requests = vec![
            envelope(json!("first")),
            RequestEnvelope::bytes(json!({"instances": [{"data": "second"}]}).to_string()),
            envelope(json!(b"third".to_vec())),
        ];
        let prompts = handler.preprocess(&requests).unwrap();
        assert_eq!(prompts, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn null_data_falls_back_to_the_raw_body() {
        let (handler, _dir) = initialized().await;
        let body = json!({"instances": [{"data": null}]});
        let prompts = handler
            .preprocess(&[RequestEnvelope::json(body.clone())])
            .unwrap();
        assert_eq!(prompts, vec![body.to_string()]);
    }

    #[tokio::test]
    async fn missing_instances_is_a_lookup_failure() {
        let (handler, _dir) = initialized().await;
        let err = handler
            .preprocess(&[RequestEnvelope::json(json!({"prompt": "x"}))])
            .unwrap_err();
        assert!(matches!(err, Error::Pipeline(_)));
        assert!(err.to_string().contains("instances"));
    }

    #[tokio::test]
    async fn inference_uses_fixed_parameters_and_keeps_order() {
        let (handler, _dir) = initialized().await;
        let prompts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let images = handler.inference(&prompts).unwrap();
        assert_eq!(images.len(), 3);
        for (index, image) in images.iter().enumerate() {
            assert_eq!(image.to_rgb8().get_pixel(0, 0).0[0], index as u8);
        }

        let calls = handler.manager().unwrap().pipeline().unwrap().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].prompts, prompts);
        assert_eq!(calls[0].guidance_scale, GUIDANCE_SCALE);
        assert_eq!(calls[0].num_inference_steps, INFERENCE_STEPS);
        assert_eq!((calls[0].height, calls[0].width), (Some(768), Some(768)));
    }

    #[tokio::test]
    async fn handle_returns_one_array_per_request() {
        let (handler, _dir) = initialized().await;
        let requests = vec![envelope(json!("a")), envelope(json!("b"))];
        let outputs = handler.handle(&requests).unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0], vec![vec![[0, 128, 255]]]);
        assert_eq!(outputs[1], vec![vec![[1, 128, 255]]]);
    }

    #[tokio::test]
    async fn inference_before_initialize_is_refused() {
        let handler = DiffusersHandler::<SolidLoader>::new();
        assert!(!handler.initialized());
        let err = handler.inference(&["a".to_string()]).unwrap_err();
        assert!(matches!(err, Error::NotReady));
    }
}
