use std::{path::PathBuf, sync::Arc};

use anyhow::{Context as _, Result};
use clap::Parser;
use easel_core::SdxlLoader;
use easel_torchserve::{router, Context, DiffusersHandler, Handler, SystemProperties, Worker};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stable Diffusion XL batch handler with LoRA archives")]
struct Args {
    /// Directory holding model.zip
    #[arg(long = "model_dir", env = "MODEL_DIR")]
    model_dir: PathBuf,

    /// Model store the archive was registered from
    #[arg(long = "model_store")]
    model_store: Option<PathBuf>,

    /// Accelerator index to run on (CPU when unset)
    #[arg(long = "gpu_id")]
    gpu_id: Option<usize>,

    /// Name the model is served under
    #[arg(long = "model_name", default_value = "sdxl")]
    model_name: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8080)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let ctx = Context::new(SystemProperties {
        model_dir: Some(args.model_dir),
        model_store: args.model_store,
        gpu_id: args.gpu_id,
    });

    let mut handler = DiffusersHandler::<SdxlLoader>::new();
    handler.initialize(&ctx).await?;

    let worker = Arc::new(Worker {
        name: args.model_name,
        handler,
    });
    let app = router(worker.clone());

    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(
        model = %worker.name,
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
