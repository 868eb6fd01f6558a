//! Core data model for weightline
//!
//! This crate provides everything needed to turn a checkpoint into the
//! records a native inference runtime ingests:
//! - Weight records and the builder that normalizes tensors into them
//! - Vocabulary and special-token encoding
//! - The stringly-typed config block
//! - Checkpoint readers (safetensors, Hugging Face model directories)

pub mod byte_level;
pub mod config;
pub mod error;
pub mod formats;
pub mod hf;
pub mod quant;
pub mod source;
pub mod special;
pub mod tensor;
pub mod tokenizer;
pub mod vocab;
pub mod weight;

pub use byte_level::ByteLevelCodec;
pub use config::{AdapterConfig, ConfigBlock, ConfigEntry, ConfigMap, TemplateStrings};
pub use error::{Error, Result};
pub use formats::safetensors::{write_safetensors, SafetensorsReader, TensorEntry};
pub use hf::{HfModel, HfModelDir};
pub use source::{InMemoryModel, ModelCapabilities, SourceModel, SourceParameter, WeightRole};
pub use special::{should_register, SpecialTokenSet};
pub use tensor::{DataType, Precision, Shape, SourceTensor, WeightKind};
pub use tokenizer::{
    MergeList, NormalizerFlags, PieceEncoding, SpecialTokens, TokenizerCapabilities,
    TokenizerSource, Vocabulary,
};
pub use vocab::{encode_vocabulary, VocabEntry};
pub use weight::{RecordPayload, WeightRecord, WeightRecordBuilder};

/// Core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
