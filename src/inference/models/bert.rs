use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Error, Result};
use hf_hub::api::sync::Api;
use hf_hub::{Repo, RepoType};

use crate::inference::classification_pipeline::ClassificationPipeline;
use crate::inference::model_config::{device_name, InferenceConfig};
use crate::inference::models::model::ModelBase;
use crate::inference::task::classify::{ClassifyHandler, ClassifyRequest, ClassifyResponse};

const HUB_CONFIG_FILE: &str = "config.json";
/// Alternatives in the order the pipeline loader looks for them.
const HUB_TOKENIZER_FILES: [&str; 2] = ["tokenizer.json", "vocab.txt"];
const HUB_WEIGHT_FILES: [&str; 2] = ["model.safetensors", "pytorch_model.bin"];

pub struct BertClassifierModel {
    base: ModelBase,
    pipeline: ClassificationPipeline,
}

impl BertClassifierModel {
    #[tracing::instrument(level = "info", skip(config), fields(model = %base.id))]
    pub fn new(base: ModelBase, config: &InferenceConfig) -> Result<Self> {
        tracing::info!("Loading model: {} ({})", base.name, base.source);

        let pipeline = resolve_model_dir(&base.source, config.hub_fallback)
            .and_then(|model_dir| ClassificationPipeline::from_dir(&model_dir, config))
            .map_err(|err| {
                tracing::error!("Failed to load model {}: {:#}", base.name, err);
                err.context(format!("Failed to load model {}", base.name))
            })?;

        tracing::info!(
            "{} loaded with {} labels, device: {}",
            base.name,
            pipeline.labels().len(),
            device_name(pipeline.device())
        );
        Ok(Self { base, pipeline })
    }

    pub fn base(&self) -> &ModelBase {
        &self.base
    }
}

impl ClassifyHandler for BertClassifierModel {
    #[tracing::instrument(level = "info", skip(self, request), fields(model = %self.base.id))]
    fn run_classify(&self, request: ClassifyRequest) -> Result<ClassifyResponse, Error> {
        let prediction = self.pipeline.classify(&request.text)?;
        tracing::debug!("{} -> {} ({:.4})", self.base.id, prediction.label, prediction.score);

        Ok(ClassifyResponse {
            label: prediction.label,
            score: prediction.score,
            model: self.base.id.clone(),
        })
    }
}

fn resolve_model_dir(source: &str, hub_fallback: bool) -> Result<PathBuf> {
    let path = Path::new(source);
    if path.exists() || !hub_fallback {
        return Ok(path.to_path_buf());
    }

    tracing::info!("{} is not a local directory, fetching it from the hub", source);
    let api = Api::new()?;
    let repo = api.repo(Repo::new(source.to_string(), RepoType::Model));
    let fetch = |file: &str| repo.get(file).map_err(Error::from);

    let config = fetch(HUB_CONFIG_FILE)
        .with_context(|| format!("Failed to download {HUB_CONFIG_FILE} from {source}"))?;
    fetch_first(&HUB_TOKENIZER_FILES, &fetch)
        .with_context(|| format!("Failed to download a tokenizer from {source}"))?;
    fetch_first(&HUB_WEIGHT_FILES, &fetch)
        .with_context(|| format!("Failed to download weights from {source}"))?;
    config
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("Invalid cache path for {source}"))
}

/// Returns the first candidate that can be fetched.
fn fetch_first<F>(candidates: &[&str], fetch: F) -> Result<PathBuf>
where
    F: Fn(&str) -> Result<PathBuf>,
{
    let mut errors = Vec::new();
    for &file in candidates {
        match fetch(file) {
            Ok(path) => return Ok(path),
            Err(err) => errors.push(format!("{file}: {err}")),
        }
    }
    bail!(
        "None of [{}] is available ({})",
        candidates.join(", "),
        errors.join(" | ")
    )
}
