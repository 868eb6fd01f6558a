//! End-to-end conversion of a source model into a native runtime

use crate::assembly::ModelAssembly;
use crate::family::{detect_family, FamilyContext, FamilyRegistry};
use crate::NativeRuntime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use weightline_core::config::{ConfigBlock, TemplateStrings};
use weightline_core::error::Result;
use weightline_core::source::SourceModel;
use weightline_core::special::{should_register, SpecialTokenSet};
use weightline_core::tensor::Precision;
use weightline_core::tokenizer::TokenizerSource;
use weightline_core::vocab::encode_vocabulary;
use weightline_core::weight::WeightRecordBuilder;

/// Prefix adapter wrappers put in front of base model weight names
pub const ADAPTER_WEIGHT_PREFIX: &str = "base_model.model.";

/// Caller-facing conversion settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvertOptions {
    /// Precision requested for linear layers
    pub dtype: Precision,
    #[serde(flatten)]
    pub templates: TemplateStrings,
    /// Family tag to use instead of the detected one
    pub family: Option<String>,
    /// Removed from weight names of models that carry adapters
    pub strip_prefix: Option<String>,
}

impl Default for ConvertOptions {
    fn default() -> Self {
        Self {
            dtype: Precision::Float16,
            templates: TemplateStrings::default(),
            family: None,
            strip_prefix: Some(ADAPTER_WEIGHT_PREFIX.to_string()),
        }
    }
}

/// What a finished conversion submitted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionReport<H> {
    pub handle: H,
    pub family: String,
    pub model_type: String,
    pub config_entries: usize,
    pub vocab_entries: usize,
    pub special_tokens: usize,
    pub weights: usize,
    pub payload_bytes: usize,
}

pub struct Converter {
    options: ConvertOptions,
    registry: FamilyRegistry,
}

impl Default for Converter {
    fn default() -> Self {
        Self::new(ConvertOptions::default())
    }
}

impl Converter {
    pub fn new(options: ConvertOptions) -> Self {
        Self { options, registry: FamilyRegistry::builtin() }
    }

    pub fn with_registry(mut self, registry: FamilyRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn options(&self) -> &ConvertOptions {
        &self.options
    }

    /// Convert `model` and its tokenizer into one finalized runtime model.
    ///
    /// Parameters are taken from `model` one at a time and dropped as soon as
    /// the runtime has them. On error the partially built handle is left in
    /// the runtime for inspection.
    pub fn convert<R, M>(
        &self,
        runtime: &mut R,
        model: &mut M,
        tokenizer: Option<TokenizerSource>,
    ) -> Result<ConversionReport<R::Handle>>
    where
        R: NativeRuntime,
        M: SourceModel,
    {
        let family = match &self.options.family {
            Some(family) => family.clone(),
            None => detect_family(model.config())?,
        };
        let profile = *self.registry.get(&family);
        log::info!("Converting {} model (profile {})", family, profile.name);

        let mut tokenizer = tokenizer;
        if let Some(t) = tokenizer.as_mut() {
            (profile.adjust_tokenizer)(t);
        }

        let mut block = ConfigBlock::from_map(model.config());
        if let Some(generation) = model.generation_config() {
            block.merge_map(generation);
        }
        self.options.templates.apply(&mut block);

        let ctx = FamilyContext {
            config: model.config(),
            generation_config: model.generation_config(),
            capabilities: model.capabilities(),
            tokenizer: tokenizer.as_ref(),
        };
        (profile.derive_config)(&ctx, &mut block);
        let hints = (profile.tensor_hints)(&ctx);

        let mut special = None;
        let mut vocab = Vec::new();
        if let Some(t) = &tokenizer {
            block.set("tokenizer_use_score", "1");
            if should_register(&t.special, &self.options.templates) {
                block.set("tokenizer_has_special_tokens", "1");
                special = Some(SpecialTokenSet::from_special(&t.special)?);
            }
            if let Some(flags) = t.normalizer {
                block.set_value("tokenizer_add_dummy_prefix", &Value::Bool(flags.add_dummy_prefix));
                block.set_value(
                    "tokenizer_remove_extra_whitespaces",
                    &Value::Bool(flags.remove_extra_whitespaces),
                );
            }
            vocab = encode_vocabulary(t)?;
        }
        drop(tokenizer);

        let model_type = block.get("model_type").unwrap_or(&family).to_string();
        let mut assembly = ModelAssembly::create(runtime, &model_type)?;

        assembly.load_config(&block, model.adapters(), model.active_adapter())?;
        log::info!("Loaded {} config entries, {} adapters", block.len(), model.adapters().len());

        assembly.load_vocab(&vocab, special.as_ref())?;
        log::info!(
            "Loaded vocabulary of {} pieces, {} special tokens",
            vocab.len(),
            special.as_ref().map_or(0, SpecialTokenSet::len)
        );

        let strip = if model.adapters().is_empty() {
            None
        } else {
            self.options.strip_prefix.as_deref().filter(|p| !p.is_empty())
        };
        let builder = WeightRecordBuilder::new(self.options.dtype);
        let names = model.parameter_names();
        let total = names.len();
        let step = (total / 10).max(1);
        let mut payload_bytes = 0;

        for (i, name) in names.iter().enumerate() {
            let mut parameter = model.take_parameter(name)?;
            if hints.normalizes(name) {
                parameter = parameter.with_row_normalization();
            }
            let mut record = builder.build(parameter)?;
            if let Some(prefix) = strip {
                record.name = record.name.replace(prefix, "");
            }
            log::debug!(
                "{} {:?} {:?} -> {}",
                record.name,
                record.shape.dims(),
                record.kind,
                record.target_dtype()
            );
            payload_bytes += record.size_bytes();
            assembly.add_weight(record)?;

            let done = i + 1;
            if done % step == 0 || done == total {
                log::info!("convert ({}/{})", done, total);
            }
        }

        assembly.finalize()?;
        log::info!("Finalized {} model with {} weights", model_type, assembly.weight_count());

        Ok(ConversionReport {
            handle: assembly.handle(),
            family,
            model_type,
            config_entries: block.len(),
            vocab_entries: vocab.len(),
            special_tokens: special.as_ref().map_or(0, SpecialTokenSet::len),
            weights: assembly.weight_count(),
            payload_bytes,
        })
    }
}
