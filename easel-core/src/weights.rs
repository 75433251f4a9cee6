//! Locating checkpoint files either on disk or on the Hugging Face hub.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hf_hub::api::tokio::{Api, ApiRepo};
use tracing::debug;

pub const LORA_WEIGHTS_FILE: &str = "pytorch_lora_weights.safetensors";

/// Where the files of one model live.
///
/// A location naming an existing path is read from disk, anything else is
/// treated as a hub repository id.
#[derive(Debug)]
pub enum WeightSource {
    Local(PathBuf),
    Hub { repo_id: String, repo: ApiRepo },
}

impl WeightSource {
    pub fn resolve(api: &Api, location: &str) -> Self {
        let path = Path::new(location);
        if path.exists() {
            Self::Local(path.to_path_buf())
        } else {
            Self::Hub {
                repo_id: location.to_string(),
                repo: api.model(location.to_string()),
            }
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Self::Local(_))
    }

    pub async fn get(&self, file: &str) -> Result<PathBuf> {
        match self {
            Self::Local(root) => {
                let path = root.join(file);
                if !path.is_file() {
                    bail!("{} does not exist", path.display());
                }
                Ok(path)
            }
            Self::Hub { repo_id, repo } => repo
                .get(file)
                .await
                .with_context(|| format!("failed to fetch {file} from {repo_id}")),
        }
    }

    /// Like [`WeightSource::get`] but optional: missing local files yield `None`.
    pub async fn find(&self, file: &str) -> Option<PathBuf> {
        match self {
            Self::Local(root) => {
                let path = root.join(file);
                path.is_file().then_some(path)
            }
            Self::Hub { repo, .. } => repo.get(file).await.ok(),
        }
    }

    /// Fetches `<component>/<stem>.<variant>.safetensors`, falling back to the
    /// untagged file when the variant is not published.
    pub async fn component(
        &self,
        component: &str,
        stem: &str,
        variant: Option<&str>,
    ) -> Result<PathBuf> {
        if let Some(variant) = variant {
            let tagged = format!("{component}/{stem}.{variant}.safetensors");
            if let Some(path) = self.find(&tagged).await {
                return Ok(path);
            }
            debug!(%tagged, "variant not found, using the untagged weights");
        }
        self.get(&format!("{component}/{stem}.safetensors")).await
    }

    /// Resolves the overlay weights file inside this source.
    pub async fn lora_file(&self) -> Result<PathBuf> {
        match self {
            Self::Local(path) if path.is_file() => Ok(path.clone()),
            Self::Local(dir) => find_lora_in_dir(dir),
            Self::Hub { .. } => self.get(LORA_WEIGHTS_FILE).await,
        }
    }
}

fn find_lora_in_dir(dir: &Path) -> Result<PathBuf> {
    let preferred = dir.join(LORA_WEIGHTS_FILE);
    if preferred.is_file() {
        return Ok(preferred);
    }
    let mut candidates = std::fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect::<Vec<_>>();
    match candidates.len() {
        0 => bail!("no LoRA safetensors file found in {}", dir.display()),
        1 => Ok(candidates.remove(0)),
        n => bail!(
            "{n} safetensors files in {}, expected {LORA_WEIGHTS_FILE} or a single file",
            dir.display()
        ),
    }
}
