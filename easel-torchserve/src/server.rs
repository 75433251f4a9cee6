use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::CONTENT_TYPE, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use easel_core::{Error, Loader};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::handler::{DiffusersHandler, Handler, RequestEnvelope};

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
            Self::Model(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = match self {
            Self::UnknownModel(name) => format!("model {name} not found"),
            Self::Model(e) => {
                if status.is_server_error() {
                    error!("prediction failed: {e:?}");
                }
                e.to_string()
            }
        };
        (status, Json(json!({ "code": status.as_u16(), "message": message }))).into_response()
    }
}

/// Handler registered under a model name.
pub struct Worker<L: Loader> {
    pub name: String,
    pub handler: DiffusersHandler<L>,
}

type SharedWorker<L> = Arc<Worker<L>>;

pub fn router<L>(worker: SharedWorker<L>) -> Router
where
    L: Loader + Send + 'static,
{
    Router::new()
        .route("/ping", get(ping::<L>))
        .route("/predictions/{name}", post(predictions::<L>))
        .with_state(worker)
        .layer(TraceLayer::new_for_http())
}

async fn ping<L: Loader + Send + 'static>(State(worker): State<SharedWorker<L>>) -> Response {
    if worker.handler.initialized() {
        Json(json!({ "status": "Healthy" })).into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "Unhealthy" })),
        )
            .into_response()
    }
}

fn envelope_of(headers: &HeaderMap, body: Bytes) -> RequestEnvelope {
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    match serde_json::from_slice::<Value>(&body) {
        Ok(value) if is_json => RequestEnvelope::json(value),
        _ => RequestEnvelope::bytes(body.to_vec()),
    }
}

/// `POST /predictions/{name}`: one request, one batch of size one.
async fn predictions<L: Loader + Send + 'static>(
    State(worker): State<SharedWorker<L>>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    if name != worker.name {
        return Err(ApiError::UnknownModel(name));
    }
    let request = envelope_of(&headers, body);
    let mut outputs = tokio::task::spawn_blocking(move || worker.handler.handle(&[request]))
        .await
        .map_err(|e| Error::Pipeline(e.into()))??;
    let output = outputs
        .pop()
        .ok_or_else(|| Error::Pipeline(anyhow::anyhow!("handler returned no output")))?;
    Ok(Json(output).into_response())
}
