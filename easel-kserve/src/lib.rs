//! Text-to-image model served over the v1 inference protocol.
//!
//! One request carries exactly one instance of named generation parameters;
//! the response carries the generated image as a base64 PNG.

pub mod envelope;
pub mod model;
pub mod server;

pub use envelope::{Envelope, InferRequest, LegacyRequest};
pub use model::{DiffusersModel, PredictResponse, Prediction, REQUEST_TYPE_HEADER};
pub use server::{router, ApiError};
