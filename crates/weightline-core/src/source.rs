//! Source model collaborator interface
//!
//! A source model is whatever produced the checkpoint: a framework object
//! held in memory or a model directory on disk. The converter only needs
//! named parameters, their roles and a handful of config mappings.

use crate::config::{AdapterConfig, ConfigMap};
use crate::error::{Error, Result};
use crate::tensor::SourceTensor;

/// Declared role of a parameter, from module-type introspection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightRole {
    Linear,
    Embedding,
    /// Weight already packed to `bit_width` bits at rest
    QuantizedLinear { bit_width: u8 },
}

/// Optional model capabilities, resolved once before conversion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCapabilities {
    /// The model builds an ALiBi attention mask instead of rotary positions
    pub alibi_mask: bool,
}

/// One parameter moved out of a source model
#[derive(Debug, Clone, PartialEq)]
pub struct SourceParameter {
    pub tensor: SourceTensor,
    pub role: Option<WeightRole>,
    /// Per-output-channel scales, only for quantized linear weights
    pub scales: Option<SourceTensor>,
    /// L2-normalize each row in full precision before narrowing
    pub normalize_rows: bool,
}

impl SourceParameter {
    pub fn new(tensor: SourceTensor, role: Option<WeightRole>) -> Self {
        Self { tensor, role, scales: None, normalize_rows: false }
    }

    pub fn quantized(tensor: SourceTensor, scales: SourceTensor, bit_width: u8) -> Self {
        Self {
            tensor,
            role: Some(WeightRole::QuantizedLinear { bit_width }),
            scales: Some(scales),
            normalize_rows: false,
        }
    }

    pub fn with_row_normalization(mut self) -> Self {
        self.normalize_rows = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.tensor.name
    }
}

/// A model whose parameters can be handed over one at a time.
///
/// `take_parameter` transfers ownership: after a parameter has been taken the
/// model no longer holds its buffer and a second take fails.
pub trait SourceModel {
    /// Model hyperparameters
    fn config(&self) -> &ConfigMap;

    /// Generation settings merged over the model config, if any
    fn generation_config(&self) -> Option<&ConfigMap> {
        None
    }

    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::default()
    }

    fn adapters(&self) -> &[AdapterConfig] {
        &[]
    }

    fn active_adapter(&self) -> Option<&str> {
        None
    }

    /// Parameter names in the model's natural enumeration order
    fn parameter_names(&self) -> Vec<String>;

    fn take_parameter(&mut self, name: &str) -> Result<SourceParameter>;
}

/// A source model held entirely in memory
#[derive(Debug, Default)]
pub struct InMemoryModel {
    config: ConfigMap,
    generation_config: Option<ConfigMap>,
    capabilities: ModelCapabilities,
    adapters: Vec<AdapterConfig>,
    active_adapter: Option<String>,
    parameters: Vec<(String, Option<SourceParameter>)>,
}

impl InMemoryModel {
    pub fn new(config: ConfigMap) -> Self {
        Self { config, ..Default::default() }
    }

    pub fn with_generation_config(mut self, generation_config: ConfigMap) -> Self {
        self.generation_config = Some(generation_config);
        self
    }

    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_adapter(mut self, adapter: AdapterConfig) -> Self {
        self.adapters.push(adapter);
        self
    }

    pub fn with_active_adapter(mut self, name: impl Into<String>) -> Self {
        self.active_adapter = Some(name.into());
        self
    }

    pub fn with_parameter(mut self, parameter: SourceParameter) -> Self {
        self.push(parameter);
        self
    }

    pub fn push(&mut self, parameter: SourceParameter) {
        self.parameters.push((parameter.name().to_string(), Some(parameter)));
    }
}

impl SourceModel for InMemoryModel {
    fn config(&self) -> &ConfigMap {
        &self.config
    }

    fn generation_config(&self) -> Option<&ConfigMap> {
        self.generation_config.as_ref()
    }

    fn capabilities(&self) -> ModelCapabilities {
        self.capabilities
    }

    fn adapters(&self) -> &[AdapterConfig] {
        &self.adapters
    }

    fn active_adapter(&self) -> Option<&str> {
        self.active_adapter.as_deref()
    }

    fn parameter_names(&self) -> Vec<String> {
        self.parameters.iter().map(|(name, _)| name.clone()).collect()
    }

    fn take_parameter(&mut self, name: &str) -> Result<SourceParameter> {
        let slot = self
            .parameters
            .iter_mut()
            .find(|(n, _)| n == name)
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown parameter: {}", name)))?;
        slot.1
            .take()
            .ok_or_else(|| Error::InvalidArgument(format!("Parameter already taken: {}", name)))
    }
}
