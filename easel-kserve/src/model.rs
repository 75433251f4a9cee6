use axum::http::{HeaderMap, HeaderValue};
use easel_core::{
    image_to_base64_png, normalize_map, Error, GenerationArgs, Loader, ModelConfig,
    ModelLifecycleManager, ParamValue, Pipeline, Result,
};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::envelope::Envelope;

pub const REQUEST_TYPE_HEADER: &str = "request-type";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EncodedImage {
    pub format: &'static str,
    pub b64: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Prediction {
    pub model_name: String,
    pub prompt: ParamValue,
    pub image: EncodedImage,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PredictResponse {
    pub predictions: Vec<Prediction>,
}

/// Single-instance text-to-image model served over the v1 protocol.
pub struct DiffusersModel<P> {
    name: String,
    manager: ModelLifecycleManager<P>,
}

impl<P: Pipeline> DiffusersModel<P> {
    pub fn new(name: impl Into<String>, config: ModelConfig) -> Self {
        Self {
            name: name.into(),
            manager: ModelLifecycleManager::new(config),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model_id(&self) -> &str {
        &self.manager.config().model_id
    }

    pub fn is_ready(&self) -> bool {
        self.manager.is_ready()
    }

    pub async fn load<L>(&self) -> Result<()>
    where
        L: Loader<Pipeline = P>,
    {
        self.manager.load::<L>().await
    }

    /// Extracts the single instance of a v1 request and tags `headers` with
    /// the detected protocol.
    pub fn preprocess(
        &self,
        envelope: Envelope,
        headers: &mut HeaderMap,
    ) -> Result<Map<String, Value>> {
        let request = match envelope {
            Envelope::Legacy(request) => request,
            Envelope::Structured(_) => {
                return Err(Error::invalid_input("v2 protocol not implemented"))
            }
            Envelope::Malformed(reason) => {
                return Err(Error::invalid_input(format!("invalid payload: {reason}")))
            }
        };
        headers.insert(REQUEST_TYPE_HEADER, HeaderValue::from_static("v1"));

        let mut instances = request.instances.into_iter();
        match (instances.next(), instances.next()) {
            (Some(Value::Object(instance)), None) => Ok(instance),
            (Some(_), None) => Err(Error::invalid_input("instance must be a JSON object")),
            (None, _) => Err(Error::invalid_input("no instances in request")),
            (Some(_), Some(_)) => Err(Error::invalid_input(
                "only one instance per request is supported",
            )),
        }
    }

    /// Runs the pipeline on one instance and encodes the first image as PNG.
    pub fn predict(&self, instance: Map<String, Value>, _headers: &HeaderMap) -> Result<PredictResponse> {
        let params = normalize_map(instance);
        let args = GenerationArgs::bind(&params)?;
        debug!(prompts = ?args.prompts, "predict");

        let images = self.manager.generate(&args)?;
        let image = images
            .first()
            .ok_or_else(|| Error::Pipeline(anyhow::anyhow!("pipeline returned no images")))?;
        let b64 = image_to_base64_png(image)?;

        Ok(PredictResponse {
            predictions: vec![Prediction {
                model_name: self.model_id().to_string(),
                prompt: params.get("prompt").cloned().unwrap_or(ParamValue::Null),
                image: EncodedImage { format: "PNG", b64 },
            }],
        })
    }

    pub fn handle(&self, envelope: Envelope, headers: &mut HeaderMap) -> Result<PredictResponse> {
        let instance = self.preprocess(envelope, headers)?;
        self.predict(instance, headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{prelude::BASE64_STANDARD, Engine};
    use easel_core::testing::{FailingLoader, SolidLoader, SolidPipeline};
    use serde_json::json;

    async fn ready_model() -> DiffusersModel<SolidPipeline> {
        let model = DiffusersModel::new("sdxl", ModelConfig::new("org/sdxl"));
        model.load::<SolidLoader>().await.unwrap();
        model
    }

    fn instance(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn preprocess_returns_the_single_instance() {
        let model = ready_model().await;
        let mut headers = HeaderMap::new();
        let body = json!({"instances": [{"prompt": "x", "target_size": [8, 8]}]});

        let out = model
            .preprocess(Envelope::from_json(body), &mut headers)
            .unwrap();
        assert_eq!(out, instance(json!({"prompt": "x", "target_size": [8, 8]})));
        assert_eq!(headers[REQUEST_TYPE_HEADER], "v1");
    }

    #[tokio::test]
    async fn preprocess_rejects_other_shapes() {
        let model = ready_model().await;
        let cases = [
            json!({"inputs": [{"name": "p", "shape": [1], "datatype": "BYTES", "data": ["x"]}]}),
            json!({"prompt": "x"}),
            json!({"instances": []}),
            json!({"instances": [{"prompt": "a"}, {"prompt": "b"}]}),
            json!({"instances": ["x"]}),
        ];
        for body in cases {
            let mut headers = HeaderMap::new();
            let err = model
                .preprocess(Envelope::from_json(body.clone()), &mut headers)
                .unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "{body}: {err}");
        }
    }

    #[tokio::test]
    async fn structured_requests_are_not_implemented() {
        let model = ready_model().await;
        let body = json!({"inputs": [{"name": "p", "shape": [1], "datatype": "BYTES", "data": ["x"]}]});
        let err = model
            .preprocess(Envelope::from_json(body), &mut HeaderMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("v2 protocol not implemented"));
    }

    #[tokio::test]
    async fn predict_encodes_the_generated_image() {
        let model = ready_model().await;
        let response = model
            .predict(instance(json!({"prompt": "x"})), &HeaderMap::new())
            .unwrap();

        assert_eq!(response.predictions.len(), 1);
        let prediction = &response.predictions[0];
        assert_eq!(prediction.model_name, "org/sdxl");
        assert_eq!(prediction.prompt, ParamValue::from("x"));
        assert_eq!(prediction.image.format, "PNG");

        let bytes = BASE64_STANDARD.decode(&prediction.image.b64).unwrap();
        let decoded = image::load_from_memory_with_format(&bytes, image::ImageFormat::Png).unwrap();
        assert_eq!(decoded.to_rgb8(), SolidPipeline::new(1, 1).image(0).to_rgb8());
    }

    #[tokio::test]
    async fn response_serializes_to_the_v1_shape() {
        let model = ready_model().await;
        let response = model
            .handle(
                Envelope::from_json(json!({"instances": [{"prompt": "x"}]})),
                &mut HeaderMap::new(),
            )
            .unwrap();
        let value = serde_json::to_value(&response).unwrap();
        let prediction = &value["predictions"][0];
        assert_eq!(prediction["model_name"], "org/sdxl");
        assert_eq!(prediction["prompt"], "x");
        assert_eq!(prediction["image"]["format"], "PNG");
        assert!(prediction["image"]["b64"].is_string());
    }

    #[tokio::test]
    async fn bad_arguments_are_pipeline_failures() {
        let model = ready_model().await;
        let err = model
            .predict(instance(json!({"prompt": "x", "not_an_argument": 0.1})), &HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::Pipeline(_)));
    }

    #[tokio::test]
    async fn size_conditioning_pairs_reach_the_pipeline() {
        let model = ready_model().await;
        let body = json!({
            "prompt": "x",
            "original_size": [1024, 1024],
            "crops_coords_top_left": [0, 0],
            "target_size": [1024, 1024],
        });
        model.predict(instance(body), &HeaderMap::new()).unwrap();

        let calls = model.manager.pipeline().unwrap().calls();
        assert_eq!(calls[0].conditioning.original_size, Some((1024, 1024)));
        assert_eq!(calls[0].conditioning.crops_coords_top_left, Some((0, 0)));
        assert_eq!((calls[0].height, calls[0].width), (None, None));
    }

    #[tokio::test]
    async fn predict_before_load_is_refused() {
        let model: DiffusersModel<SolidPipeline> =
            DiffusersModel::new("sdxl", ModelConfig::new("/missing"));
        assert!(model.load::<FailingLoader>().await.is_err());
        assert!(!model.is_ready());
        let err = model
            .predict(instance(json!({"prompt": "x"})), &HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, Error::NotReady));
    }
}
