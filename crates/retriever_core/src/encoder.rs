use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Module, Tensor, Var, D};
use candle_nn::{Embedding, Init, Linear, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::tokenize::PAD_ID;

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

// ---------------------------------------------------------------------------
// Config (HuggingFace `config.json` field names)
// ---------------------------------------------------------------------------

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl BertConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config: BertConfig =
            serde_json::from_str(&text).with_context(|| format!("parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            bail!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size,
                self.num_attention_heads
            );
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

// ---------------------------------------------------------------------------
// Layer norm (with bias)
// ---------------------------------------------------------------------------

struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    fn load(vb: VarBuilder, hidden_size: usize, eps: f64) -> Result<Self> {
        let weight = vb.get_with_hints(hidden_size, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(hidden_size, "bias", Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mean = x.mean_keepdim(D::Minus1)?;
        let diff = x.broadcast_sub(&mean)?;
        let var = diff.sqr()?.mean_keepdim(D::Minus1)?;
        let std = (var + self.eps)?.sqrt()?;
        let normed = diff.broadcast_div(&std)?;
        normed
            .broadcast_mul(&self.weight)?
            .broadcast_add(&self.bias)
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Self-attention (separate Q/K/V with biases, additive padding mask)
// ---------------------------------------------------------------------------

struct BertSelfAttention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl BertSelfAttention {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        let h = config.hidden_size;
        let attn_vb = vb.pp("attention");

        Ok(Self {
            query: candle_nn::linear(h, h, attn_vb.pp("self").pp("query"))?,
            key: candle_nn::linear(h, h, attn_vb.pp("self").pp("key"))?,
            value: candle_nn::linear(h, h, attn_vb.pp("self").pp("value"))?,
            output: candle_nn::linear(h, h, attn_vb.pp("output").pp("dense"))?,
            output_norm: LayerNorm::load(
                attn_vb.pp("output").pp("LayerNorm"),
                h,
                config.layer_norm_eps,
            )?,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    fn split_heads(&self, x: &Tensor, batch: usize, seq_len: usize) -> Result<Tensor> {
        x.reshape((batch, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
            .map_err(Into::into)
    }

    /// `mask_bias` is `[batch, 1, 1, seq]` with 0 for tokens and a large
    /// negative value for padding.
    fn forward(&self, x: &Tensor, mask_bias: &Tensor) -> Result<Tensor> {
        let (batch, seq_len, _) = x.dims3()?;

        let q = self.split_heads(&self.query.forward(x)?, batch, seq_len)?;
        let k = self.split_heads(&self.key.forward(x)?, batch, seq_len)?;
        let v = self.split_heads(&self.value.forward(x)?, batch, seq_len)?;

        let scale = (self.head_dim as f64).sqrt();
        let attn_weights = q
            .matmul(&k.t()?.contiguous()?)?
            .affine(1.0 / scale, 0.0)?
            .broadcast_add(mask_bias)?;
        let attn_weights = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let attn_out = attn_weights.matmul(&v)?;

        let attn_out = attn_out.transpose(1, 2)?.contiguous()?.reshape((
            batch,
            seq_len,
            self.num_heads * self.head_dim,
        ))?;
        let attn_out = self.output.forward(&attn_out)?;

        // Residual + post-norm
        let x = (x + attn_out)?;
        self.output_norm.forward(&x)
    }
}

// ---------------------------------------------------------------------------
// FFN (up + GELU + down, with biases) + post-norm
// ---------------------------------------------------------------------------

struct BertFfn {
    up: Linear,
    down: Linear,
    output_norm: LayerNorm,
}

impl BertFfn {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        Ok(Self {
            up: candle_nn::linear(
                config.hidden_size,
                config.intermediate_size,
                vb.pp("intermediate").pp("dense"),
            )?,
            down: candle_nn::linear(
                config.intermediate_size,
                config.hidden_size,
                vb.pp("output").pp("dense"),
            )?,
            output_norm: LayerNorm::load(
                vb.pp("output").pp("LayerNorm"),
                config.hidden_size,
                config.layer_norm_eps,
            )?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.up.forward(x)?.gelu_erf()?;
        let h = self.down.forward(&h)?;
        let x = (x + h)?;
        self.output_norm.forward(&x)
    }
}

struct BertLayer {
    attention: BertSelfAttention,
    ffn: BertFfn,
}

impl BertLayer {
    fn load(vb: VarBuilder, config: &BertConfig) -> Result<Self> {
        Ok(Self {
            attention: BertSelfAttention::load(vb.clone(), config)?,
            ffn: BertFfn::load(vb, config)?,
        })
    }

    fn forward(&self, x: &Tensor, mask_bias: &Tensor) -> Result<Tensor> {
        let x = self.attention.forward(x, mask_bias)?;
        self.ffn.forward(&x)
    }
}

// ---------------------------------------------------------------------------
// Encoder
// ---------------------------------------------------------------------------

/// BERT encoder whose output is the pooler's `tanh(W · h[CLS] + b)`.
///
/// Weights live in a [`VarMap`] so the same instance can be trained, saved
/// and reloaded.
pub struct BertEncoder {
    word_embeddings: Embedding,
    position_embeddings: Embedding,
    token_type_embeddings: Embedding,
    embedding_norm: LayerNorm,
    layers: Vec<BertLayer>,
    pooler: Linear,
    config: BertConfig,
    varmap: VarMap,
    device: Device,
}

impl BertEncoder {
    /// Randomly initialized encoder.
    pub fn new(config: BertConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let emb_vb = vb.pp("embeddings");
        let word_embeddings = candle_nn::embedding(
            config.vocab_size,
            config.hidden_size,
            emb_vb.pp("word_embeddings"),
        )?;
        let position_embeddings = candle_nn::embedding(
            config.max_position_embeddings,
            config.hidden_size,
            emb_vb.pp("position_embeddings"),
        )?;
        let token_type_embeddings = candle_nn::embedding(
            config.type_vocab_size,
            config.hidden_size,
            emb_vb.pp("token_type_embeddings"),
        )?;
        let embedding_norm = LayerNorm::load(
            emb_vb.pp("LayerNorm"),
            config.hidden_size,
            config.layer_norm_eps,
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            layers.push(BertLayer::load(
                vb.pp("encoder").pp("layer").pp(i.to_string()),
                &config,
            )?);
        }

        let pooler = candle_nn::linear(
            config.hidden_size,
            config.hidden_size,
            vb.pp("pooler").pp("dense"),
        )?;

        Ok(Self {
            word_embeddings,
            position_embeddings,
            token_type_embeddings,
            embedding_norm,
            layers,
            pooler,
            config,
            varmap,
            device: device.clone(),
        })
    }

    /// Build from a checkpoint directory holding `config.json` and, when
    /// available, `model.safetensors`.
    pub fn from_pretrained(dir: &Path, device: &Device) -> Result<Self> {
        let config = BertConfig::from_file(&dir.join(CONFIG_FILE))?;
        let encoder = Self::new(config, device)?;

        let weights = dir.join(WEIGHTS_FILE);
        if weights.exists() {
            encoder.load_weights(&weights)?;
        } else {
            warn!(
                "no {} in {}; encoder starts from random weights",
                WEIGHTS_FILE,
                dir.display()
            );
        }
        Ok(encoder)
    }

    /// Overwrite parameters from a safetensors file. Tensor names may carry a
    /// `bert.` prefix; parameters absent from the file keep their values.
    pub fn load_weights(&self, path: &Path) -> Result<()> {
        let tensors: HashMap<String, Tensor> = candle_core::safetensors::load(path, &self.device)
            .with_context(|| format!("load weights {}", path.display()))?;

        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow::anyhow!("encoder weights lock poisoned"))?;
        let mut missing = Vec::new();
        for (name, var) in data.iter() {
            let found = tensors
                .get(name)
                .or_else(|| tensors.get(&format!("bert.{name}")));
            match found {
                Some(t) => {
                    let t = t.to_dtype(DType::F32)?;
                    if t.dims() != var.dims() {
                        bail!(
                            "tensor {name}: shape {:?} does not match expected {:?}",
                            t.dims(),
                            var.dims()
                        );
                    }
                    var.set(&t).with_context(|| format!("set tensor {name}"))?;
                }
                None => missing.push(name.clone()),
            }
        }

        if missing.len() == data.len() {
            bail!("{} holds none of the encoder's tensors", path.display());
        }
        if !missing.is_empty() {
            missing.sort();
            warn!(
                count = missing.len(),
                "tensors missing from {}, kept initial values: {}",
                path.display(),
                missing.join(", ")
            );
        }
        info!("loaded encoder weights from {}", path.display());
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        self.varmap
            .save(path)
            .with_context(|| format!("save encoder {}", path.display()))
    }

    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    /// `input_ids` is `[batch, seq]` u32, `attention_mask` `[batch, seq]` f32.
    /// Returns pooled `[batch, hidden]`.
    pub fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor> {
        let (_batch, seq_len) = input_ids.dims2()?;
        if seq_len > self.config.max_position_embeddings {
            bail!(
                "input length {seq_len} exceeds max {}",
                self.config.max_position_embeddings
            );
        }

        let position_ids = Tensor::arange(0u32, seq_len as u32, &self.device)?;
        let token_type_ids = input_ids.zeros_like()?;

        let word = self.word_embeddings.forward(input_ids)?;
        let pos = self.position_embeddings.forward(&position_ids)?;
        let types = self.token_type_embeddings.forward(&token_type_ids)?;
        let mut hidden = word.broadcast_add(&pos)?.add(&types)?;
        hidden = self.embedding_norm.forward(&hidden)?;

        let mask_bias = attention_mask
            .affine(1.0, -1.0)?
            .affine(10_000.0, 0.0)?
            .unsqueeze(1)?
            .unsqueeze(1)?;

        for layer in &self.layers {
            hidden = layer.forward(&hidden, &mask_bias)?;
        }

        let cls = hidden.narrow(1, 0, 1)?.squeeze(1)?;
        self.pooler.forward(&cls)?.tanh().map_err(Into::into)
    }

    /// Right-pad token id sequences and run the encoder.
    pub fn encode_batch(&self, batch: &[Vec<u32>]) -> Result<Tensor> {
        let (ids, mask) = pad_batch(batch, &self.device)?;
        debug!(batch = batch.len(), seq_len = ids.dim(1)?, "encode batch");
        self.forward(&ids, &mask)
    }
}

/// `[batch, max_len]` ids padded with `[PAD]` and the matching 0/1 mask.
pub fn pad_batch(batch: &[Vec<u32>], device: &Device) -> Result<(Tensor, Tensor)> {
    if batch.is_empty() {
        bail!("cannot encode an empty batch");
    }
    let max_len = batch.iter().map(Vec::len).max().unwrap_or(0).max(1);

    let mut ids = Vec::with_capacity(batch.len() * max_len);
    let mut mask = Vec::with_capacity(batch.len() * max_len);
    for seq in batch {
        ids.extend_from_slice(seq);
        ids.extend(std::iter::repeat(PAD_ID).take(max_len - seq.len()));
        mask.extend(std::iter::repeat(1.0f32).take(seq.len()));
        mask.extend(std::iter::repeat(0.0f32).take(max_len - seq.len()));
    }

    let ids = Tensor::from_vec(ids, (batch.len(), max_len), device)?;
    let mask = Tensor::from_vec(mask, (batch.len(), max_len), device)?;
    Ok((ids, mask))
}
