use std::collections::HashMap;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use serde::Deserialize;
use serde_json::Value;
use tokenizers::models::wordpiece::WordPiece;
use tokenizers::normalizers::BertNormalizer;
use tokenizers::pre_tokenizers::bert::BertPreTokenizer;
use tokenizers::processors::bert::BertProcessing;
use tokenizers::{Tokenizer, TruncationParams};

use crate::inference::model_config::InferenceConfig;
use crate::inference::task::classify::Label;

/// The classification-specific part of a HuggingFace `config.json`.
#[derive(Deserialize, Debug, Default)]
struct HeadConfig {
    #[serde(default)]
    id2label: Option<HashMap<String, Value>>,
    #[serde(default)]
    num_labels: Option<usize>,
    #[serde(default)]
    problem_type: Option<String>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Activation {
    Softmax,
    Sigmoid,
}

impl Activation {
    /// Same rule the HuggingFace text-classification pipeline applies.
    pub fn for_head(problem_type: Option<&str>, num_labels: usize) -> Self {
        if problem_type == Some("multi_label_classification") || num_labels == 1 {
            Activation::Sigmoid
        } else {
            Activation::Softmax
        }
    }

    pub fn apply(&self, logits: &Tensor) -> Result<Vec<f32>> {
        let probs = match self {
            Activation::Softmax => candle_nn::ops::softmax(logits, D::Minus1)?,
            Activation::Sigmoid => candle_nn::ops::sigmoid(logits)?,
        };
        Ok(probs.to_vec1()?)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub label: Label,
    pub score: f64,
}

// BertForSequenceClassification: encoder, pooler over [CLS], linear head.
pub struct ClassificationPipeline {
    model: BertModel,
    pooler: Option<Linear>,
    classifier: Linear,
    tokenizer: Tokenizer,
    labels: Vec<Label>,
    activation: Activation,
    device: Device,
}

impl ClassificationPipeline {
    #[tracing::instrument(level = "info", skip(config))]
    pub fn from_dir(model_dir: &Path, config: &InferenceConfig) -> Result<Self> {
        if !model_dir.is_dir() {
            bail!("Model path does not exist: {}", model_dir.display());
        }

        let config_path = model_dir.join("config.json");
        let raw_config = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let bert_config: BertConfig = serde_json::from_str(&raw_config)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        let head_config: HeadConfig = serde_json::from_str(&raw_config)?;

        let labels = resolve_labels(&head_config)?;
        let activation = Activation::for_head(head_config.problem_type.as_deref(), labels.len());

        let max_length = config.max_length.min(bert_config.max_position_embeddings);
        let mut tokenizer = load_tokenizer(model_dir)?;
        tokenizer
            .with_truncation(Some(TruncationParams {
                max_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow!(e))?;
        tokenizer.with_padding(None);

        let (device, dtype) = config.select_device()?;
        let vb = load_var_builder(model_dir, dtype, &device)?;
        let (model, encoder_vb) = load_backbone(vb.clone(), &bert_config)?;
        let pooler = if encoder_vb.contains_tensor("pooler.dense.weight") {
            let pooler = candle_nn::linear(
                bert_config.hidden_size,
                bert_config.hidden_size,
                encoder_vb.pp("pooler").pp("dense"),
            )
            .with_context(|| format!("Incompatible pooler weights in {}", model_dir.display()))?;
            Some(pooler)
        } else {
            tracing::debug!("No pooler weights found, classifying the raw [CLS] state");
            None
        };
        let classifier =
            candle_nn::linear(bert_config.hidden_size, labels.len(), vb.pp("classifier"))
                .with_context(|| {
                    format!(
                        "No classification head with {} labels in {}",
                        labels.len(),
                        model_dir.display()
                    )
                })?;

        Ok(Self {
            model,
            pooler,
            classifier,
            tokenizer,
            labels,
            activation,
            device,
        })
    }

    #[tracing::instrument(level = "debug", skip(self, text), fields(len = text.len()))]
    pub fn classify(&self, text: &str) -> Result<Prediction> {
        let encoding = self.tokenizer.encode(text, true).map_err(|e| anyhow!(e))?;

        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let token_type_ids = Tensor::new(encoding.get_type_ids(), &self.device)?.unsqueeze(0)?;
        let attention_mask =
            Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;

        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))?;
        let cls = hidden.i((.., 0))?;
        let pooled = match &self.pooler {
            Some(pooler) => pooler.forward(&cls)?.tanh()?,
            None => cls,
        };
        let logits = self
            .classifier
            .forward(&pooled)?
            .squeeze(0)?
            .to_dtype(DType::F32)?;

        let probs = self.activation.apply(&logits)?;
        let (index, score) =
            top_prediction(&probs).ok_or_else(|| anyhow!("Model produced no scores"))?;
        let label = self
            .labels
            .get(index)
            .cloned()
            .unwrap_or_else(|| Label::Text(format!("LABEL_{index}")));

        Ok(Prediction {
            label,
            score: f64::from(score).clamp(0.0, 1.0),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }
}

fn resolve_labels(head: &HeadConfig) -> Result<Vec<Label>> {
    let id2label = head.id2label.clone().unwrap_or_default();
    let num_labels = if id2label.is_empty() {
        head.num_labels.unwrap_or(2)
    } else {
        id2label.len()
    };
    if num_labels == 0 {
        bail!("Model declares no labels");
    }

    (0..num_labels)
        .map(|index| match id2label.get(&index.to_string()) {
            Some(Value::Number(number)) => number
                .as_i64()
                .map(Label::Id)
                .ok_or_else(|| anyhow!("Label {index} is not an integer: {number}")),
            Some(Value::String(text)) => Ok(Label::Text(text.clone())),
            Some(other) => Err(anyhow!("Unsupported label {index}: {other}")),
            None => Ok(Label::Text(format!("LABEL_{index}"))),
        })
        .collect()
}

pub fn top_prediction(probs: &[f32]) -> Option<(usize, f32)> {
    probs
        .iter()
        .copied()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
}

fn load_tokenizer(model_dir: &Path) -> Result<Tokenizer> {
    let tokenizer_path = model_dir.join("tokenizer.json");
    if tokenizer_path.exists() {
        return Tokenizer::from_file(&tokenizer_path).map_err(|e| anyhow!(e));
    }

    let vocab_path = model_dir.join("vocab.txt");
    if !vocab_path.exists() {
        bail!(
            "No tokenizer found in {} (tried tokenizer.json, vocab.txt)",
            model_dir.display()
        );
    }
    tracing::debug!("Building WordPiece tokenizer from {}", vocab_path.display());

    let wordpiece = WordPiece::from_file(&vocab_path.to_string_lossy())
        .unk_token("[UNK]".to_string())
        .build()
        .map_err(|e| anyhow!(e))?;
    let mut tokenizer = Tokenizer::new(wordpiece);
    let special = |token: &str| {
        tokenizer
            .token_to_id(token)
            .map(|id| (token.to_string(), id))
            .ok_or_else(|| anyhow!("Vocabulary has no {token} token"))
    };
    let (sep, cls) = (special("[SEP]")?, special("[CLS]")?);
    tokenizer.with_normalizer(Some(BertNormalizer::default()));
    tokenizer.with_pre_tokenizer(Some(BertPreTokenizer));
    tokenizer.with_post_processor(Some(BertProcessing::new(sep, cls)));
    Ok(tokenizer)
}

fn load_var_builder(model_dir: &Path, dtype: DType, device: &Device) -> Result<VarBuilder<'static>> {
    let safetensors = model_dir.join("model.safetensors");
    if safetensors.exists() {
        // SAFETY: the weights file is not modified while the process runs.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[safetensors], dtype, device)? };
        return Ok(vb);
    }

    let pytorch = model_dir.join("pytorch_model.bin");
    if pytorch.exists() {
        return Ok(VarBuilder::from_pth(pytorch, dtype, device)?);
    }

    bail!(
        "No weights found in {} (tried model.safetensors, pytorch_model.bin)",
        model_dir.display()
    )
}

fn load_backbone(
    vb: VarBuilder<'static>,
    config: &BertConfig,
) -> Result<(BertModel, VarBuilder<'static>)> {
    let mut errors = Vec::new();
    for prefix in ["bert", ""] {
        let vb_prefix = if prefix.is_empty() {
            vb.clone()
        } else {
            vb.pp(prefix)
        };
        match BertModel::load(vb_prefix.clone(), config) {
            Ok(model) => {
                tracing::debug!(
                    "Loaded BERT encoder from '{}'",
                    if prefix.is_empty() { "<root>" } else { prefix }
                );
                return Ok((model, vb_prefix));
            }
            Err(e) => errors.push(format!(
                "{}: {}",
                if prefix.is_empty() { "<root>" } else { prefix },
                e
            )),
        }
    }
    bail!(
        "Failed to load BERT encoder with tried prefixes [{}]",
        errors.join(" | ")
    )
}
