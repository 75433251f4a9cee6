use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use easel_core::{Error, Pipeline};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::{
    envelope::Envelope,
    model::{DiffusersModel, REQUEST_TYPE_HEADER},
};

/// Errors surfaced to HTTP clients.
#[derive(Debug)]
pub enum ApiError {
    Model(Error),
    UnknownModel(String),
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self::Model(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::UnknownModel(_) => StatusCode::NOT_FOUND,
            Self::Model(Error::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            Self::Model(Error::NotReady) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Model(Error::Configuration(_) | Error::Pipeline(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match self {
            Self::UnknownModel(name) => format!("model {name} not found"),
            Self::Model(e) => {
                if status.is_server_error() {
                    error!("request failed: {e:?}");
                }
                e.to_string()
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type SharedModel<P> = Arc<DiffusersModel<P>>;

pub fn router<P: Pipeline + 'static>(model: SharedModel<P>) -> Router {
    Router::new()
        .route("/", get(live))
        .route("/v1/models", get(list_models::<P>))
        .route("/v1/models/{target}", get(model_ready::<P>).post(predict::<P>))
        .route("/v2/models/{name}/infer", post(infer::<P>))
        .with_state(model)
        .layer(TraceLayer::new_for_http())
}

async fn live() -> Json<serde_json::Value> {
    Json(json!({ "status": "alive" }))
}

async fn list_models<P: Pipeline + 'static>(
    State(model): State<SharedModel<P>>,
) -> Json<serde_json::Value> {
    Json(json!({ "models": [model.name()] }))
}

fn check_name<P: Pipeline>(model: &DiffusersModel<P>, name: &str) -> Result<(), ApiError> {
    if name == model.name() {
        Ok(())
    } else {
        Err(ApiError::UnknownModel(name.to_string()))
    }
}

async fn model_ready<P: Pipeline + 'static>(
    State(model): State<SharedModel<P>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    check_name(&model, &name)?;
    let ready = model.is_ready();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(json!({ "name": name, "ready": ready }))).into_response())
}

/// `POST /v1/models/{name}:predict`. The verb shares the path segment with
/// the model name, so it is split off here.
async fn predict<P: Pipeline + 'static>(
    State(model): State<SharedModel<P>>,
    Path(target): Path<String>,
    mut headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let name = target
        .strip_suffix(":predict")
        .ok_or_else(|| ApiError::UnknownModel(target.clone()))?;
    check_name(&model, name)?;

    let envelope = Envelope::from_slice(&body);
    let (response, headers) = tokio::task::spawn_blocking(move || {
        let response = model.handle(envelope, &mut headers);
        (response, headers)
    })
    .await
    .map_err(|e| Error::Pipeline(e.into()))?;

    let mut response_headers = HeaderMap::new();
    if let Some(value) = headers.get(REQUEST_TYPE_HEADER) {
        response_headers.insert(REQUEST_TYPE_HEADER, value.clone());
    }
    Ok((response_headers, Json(response?)).into_response())
}

async fn infer<P: Pipeline + 'static>(
    State(model): State<SharedModel<P>>,
    Path(name): Path<String>,
    mut headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    check_name(&model, &name)?;
    let envelope = match Envelope::from_slice(&body) {
        Envelope::Legacy(_) => Envelope::Malformed("v1 body sent to the v2 endpoint".to_string()),
        other => other,
    };
    let response = model.handle(envelope, &mut headers)?;
    Ok(Json(response).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use easel_core::testing::{SolidLoader, SolidPipeline};
    use easel_core::ModelConfig;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn app(load: bool) -> Router {
        let model = Arc::new(DiffusersModel::<SolidPipeline>::new(
            "sdxl",
            ModelConfig::new("org/sdxl"),
        ));
        if load {
            model.load::<SolidLoader>().await.unwrap();
        }
        router(model)
    }

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, HeaderMap, serde_json::Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, serde_json::from_slice(&bytes).unwrap())
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn readiness_follows_the_load() {
        let request = || Request::get("/v1/models/sdxl").body(Body::empty()).unwrap();

        let (status, _, body) = send(app(false).await, request()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ready"], false);

        let (status, _, body) = send(app(true).await, request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"name": "sdxl", "ready": true}));
    }

    #[tokio::test]
    async fn predict_round_trip() {
        let request = post_json("/v1/models/sdxl:predict", json!({"instances": [{"prompt": "x"}]}));
        let (status, headers, body) = send(app(true).await, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[REQUEST_TYPE_HEADER], "v1");
        assert_eq!(body["predictions"][0]["prompt"], "x");
        assert_eq!(body["predictions"][0]["image"]["format"], "PNG");
    }

    #[tokio::test]
    async fn malformed_payload_is_a_client_error() {
        let request = post_json("/v1/models/sdxl:predict", json!({"prompt": "x"}));
        let (status, _, body) = send(app(true).await, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("invalid payload"));
    }

    #[tokio::test]
    async fn v2_infer_is_a_client_error() {
        let request = post_json(
            "/v2/models/sdxl/infer",
            json!({"inputs": [{"name": "prompt", "shape": [1], "datatype": "BYTES", "data": ["x"]}]}),
        );
        let (status, _, body) = send(app(true).await, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("v2 protocol not implemented"));
    }

    #[tokio::test]
    async fn incomplete_v2_bodies_are_client_errors() {
        let bodies = [
            json!({"inputs": [{"name": "prompt", "data": ["x"]}]}),
            json!({"instances": [{"prompt": "x"}]}),
            json!(["x"]),
        ];
        for body in bodies {
            let request = post_json("/v2/models/sdxl/infer", body.clone());
            let (status, _, response) = send(app(true).await, request).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert!(response["error"].is_string());
        }
    }

    #[tokio::test]
    async fn predict_before_ready_is_unavailable() {
        let request = post_json("/v1/models/sdxl:predict", json!({"instances": [{"prompt": "x"}]}));
        let (status, _, _) = send(app(false).await, request).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn unknown_models_are_not_found() {
        let request = post_json("/v1/models/other:predict", json!({"instances": [{"prompt": "x"}]}));
        let (status, _, _) = send(app(true).await, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let request = post_json("/v1/models/sdxl:explain", json!({"instances": [{"prompt": "x"}]}));
        let (status, _, _) = send(app(true).await, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lists_the_served_model() {
        let request = Request::get("/v1/models").body(Body::empty()).unwrap();
        let (status, _, body) = send(app(false).await, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"models": ["sdxl"]}));
    }
}
