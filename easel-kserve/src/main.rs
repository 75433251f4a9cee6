use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use easel_core::{ConfigOverrides, ModelConfig, SdxlLoader, SdxlPipeline};
use easel_kserve::{router, DiffusersModel};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stable Diffusion XL predictor (v1 protocol)")]
struct Args {
    /// Name the model is served under
    #[arg(long = "model_name", default_value = "model")]
    model_name: String,

    /// Model ID to load (default: /mnt/models)
    #[arg(long = "model_id")]
    model_id: Option<String>,

    /// LoRA weights will be loaded from this directory
    #[arg(long = "lora_dir")]
    lora_dir: Option<String>,

    /// Device to use: cuda (default), cpu, enable_model_cpu_offload,
    /// enable_sequential_cpu_offload
    #[arg(long)]
    device: Option<String>,

    /// Directory for fused LoRA weights
    #[arg(long = "work_dir")]
    work_dir: Option<PathBuf>,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long = "http_port", default_value_t = 8080)]
    http_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let overrides = ConfigOverrides {
        model_id: args.model_id,
        lora_dir: args.lora_dir,
        device: args.device,
    };
    let mut config = ModelConfig::from_env(&overrides)?;
    if let Some(work_dir) = args.work_dir {
        config = config.with_work_dir(work_dir);
    }

    let model = Arc::new(DiffusersModel::<SdxlPipeline>::new(args.model_name, config));
    model.load::<SdxlLoader>().await?;

    let app = router(model.clone());

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.http_port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(
        model = model.name(),
        address = %listener.local_addr()?,
        "started server"
    );
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    Ok(())
}
