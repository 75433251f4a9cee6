//! Batch text-to-image handler for model archives carrying LoRA weights.
//!
//! At startup the handler unpacks `model.zip` from the model directory and
//! layers its LoRA weights over the pretrained base pipeline. Each request
//! carries a prompt under `instances[0].data`; each response is the generated
//! image as a height x width x 3 array of 8-bit channels.

pub mod archive;
pub mod context;
pub mod handler;
pub mod server;

pub use archive::extract_archive;
pub use context::{Context, SystemProperties};
pub use handler::{DiffusersHandler, Handler, RequestBody, RequestEnvelope, BASE_MODEL_ID};
pub use server::{router, ApiError, Worker};
