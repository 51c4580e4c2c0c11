use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::error::RetrievalError;

pub const DEFAULT_SEED: u64 = 2024;
pub const DEFAULT_TOPK: usize = 3;
pub const DEFAULT_NUM_NEG: usize = 2;
pub const DEFAULT_MODEL: &str = "bert-base-multilingual-cased";
pub const DEFAULT_DATASET: &str = "../../data/train_dataset";
pub const DEFAULT_DATA_PATH: &str = "../../data";
pub const DEFAULT_CONTEXT_PATH: &str = "wikipedia_documents.json";
pub const HYBRID_MODEL_FILE: &str = "hybrid_logistic.bin";

/// Dense encoder training hyper-parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingArgs {
    pub output_dir: String,
    pub learning_rate: f64,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub num_train_epochs: usize,
    pub weight_decay: f64,
    pub max_seq_len: usize,
    pub seed: u64,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            output_dir: "dense_retrieval".to_string(),
            learning_rate: 3e-5,
            per_device_train_batch_size: 1,
            per_device_eval_batch_size: 2,
            num_train_epochs: 5,
            weight_decay: 0.01,
            max_seq_len: 512,
            seed: DEFAULT_SEED,
        }
    }
}

impl TrainingArgs {
    pub fn validate(&self) -> Result<(), RetrievalError> {
        let positive = [
            ("per_device_train_batch_size", self.per_device_train_batch_size),
            ("per_device_eval_batch_size", self.per_device_eval_batch_size),
            ("num_train_epochs", self.num_train_epochs),
            ("max_seq_len", self.max_seq_len),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(RetrievalError::InvalidArgument(format!("{name} must be > 0")));
            }
        }
        if !(self.learning_rate > 0.0) {
            return Err(RetrievalError::InvalidArgument(
                "learning_rate must be > 0".to_string(),
            ));
        }
        if self.max_seq_len < 2 {
            return Err(RetrievalError::InvalidArgument(
                "max_seq_len must leave room for [CLS] and [SEP]".to_string(),
            ));
        }
        Ok(())
    }
}

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const VARIANTS: &'static [&'static str] = &[$($text),+];
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($name::$variant => f.write_str($text)),+
                }
            }
        }

        impl FromStr for $name {
            type Err = RetrievalError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    other => Err(RetrievalError::InvalidArgument(format!(
                        "unknown {} '{}' (expected one of: {})",
                        stringify!($name),
                        other,
                        $name::VARIANTS.join(", ")
                    ))),
                }
            }
        }
    };
}

/// `train` fits the encoders and rebuilds every artifact; `eval` reuses what
/// is already on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Train,
    Eval,
}

string_enum!(RunMode { Train => "train", Eval => "eval" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenseMethod {
    Bert,
}

string_enum!(DenseMethod { Bert => "bert" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Cpu,
    Cuda,
}

string_enum!(DeviceKind { Cpu => "cpu", Cuda => "cuda" });

impl DeviceKind {
    pub fn device(self) -> Result<Device> {
        match self {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Cuda => Device::new_cuda(0).map_err(Into::into),
        }
    }
}
