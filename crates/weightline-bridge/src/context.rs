use crate::NativeRuntime;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use weightline_core::config::{ConfigBlock, ConfigEntry};
use weightline_core::error::{Error, Result};
use weightline_core::special::SpecialTokenSet;
use weightline_core::tensor::{Precision, WeightKind};
use weightline_core::vocab::VocabEntry;

/// A weight as the runtime received it
#[derive(Debug, Clone, PartialEq)]
pub struct NativeWeight {
    pub name: String,
    pub shape: Vec<i32>,
    pub kind: WeightKind,
    pub target_dtype: Precision,
    pub source_dtype: Precision,
    pub bit_width: Option<u8>,
    pub size_bytes: usize,
    /// Payload, kept only when the runtime retains payloads
    pub data: Option<Vec<u8>>,
    pub scales: Option<Vec<f32>>,
}

/// One model held by `MemoryRuntime`
#[derive(Debug, Clone, Default)]
pub struct NativeModel {
    pub family: String,
    pub config: ConfigBlock,
    pub adapters: Vec<(String, ConfigBlock)>,
    pub active_adapter: Option<String>,
    pub vocab: Vec<VocabEntry>,
    pub special_tokens: Option<SpecialTokenSet>,
    pub weights: Vec<NativeWeight>,
    pub initialized: bool,
    pub warmed_up: bool,
    weight_names: HashSet<String>,
}

impl NativeModel {
    pub fn weight(&self, name: &str) -> Option<&NativeWeight> {
        self.weights.iter().find(|w| w.name == name)
    }

    pub fn adapter(&self, name: &str) -> Option<&ConfigBlock> {
        self.adapters.iter().find(|(n, _)| n == name).map(|(_, block)| block)
    }

    pub fn manifest(&self) -> ModelManifest {
        ModelManifest {
            family: self.family.clone(),
            config: self.config.entries().to_vec(),
            adapters: self
                .adapters
                .iter()
                .map(|(name, block)| (name.clone(), block.entries().to_vec()))
                .collect(),
            active_adapter: self.active_adapter.clone(),
            vocab_size: self.vocab.len(),
            special_tokens: self.special_tokens.as_ref().map_or(0, SpecialTokenSet::len),
            weights: self.weights.iter().map(WeightSummary::from).collect(),
            initialized: self.initialized,
            warmed_up: self.warmed_up,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSummary {
    pub name: String,
    pub shape: Vec<i32>,
    pub kind: WeightKind,
    pub target_dtype: Precision,
    pub source_dtype: Precision,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub bit_width: Option<u8>,
    pub size_bytes: usize,
}

impl From<&NativeWeight> for WeightSummary {
    fn from(w: &NativeWeight) -> Self {
        Self {
            name: w.name.clone(),
            shape: w.shape.clone(),
            kind: w.kind,
            target_dtype: w.target_dtype,
            source_dtype: w.source_dtype,
            bit_width: w.bit_width,
            size_bytes: w.size_bytes,
        }
    }
}

/// JSON-serializable description of an assembled model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub family: String,
    pub config: Vec<ConfigEntry>,
    pub adapters: Vec<(String, Vec<ConfigEntry>)>,
    pub active_adapter: Option<String>,
    pub vocab_size: usize,
    pub special_tokens: usize,
    pub weights: Vec<WeightSummary>,
    pub initialized: bool,
    pub warmed_up: bool,
}

/// In-process runtime that records every submission
#[derive(Debug)]
pub struct MemoryRuntime {
    models: HashMap<u32, NativeModel>,
    next_id: u32,
    retain_payloads: bool,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self { models: HashMap::new(), next_id: 1, retain_payloads: true }
    }

    /// Only record sizes of submitted buffers, not their bytes
    pub fn without_payloads() -> Self {
        Self { retain_payloads: false, ..Self::new() }
    }

    pub fn model(&self, handle: u32) -> Option<&NativeModel> {
        self.models.get(&handle)
    }

    pub fn remove_model(&mut self, handle: u32) -> Option<NativeModel> {
        self.models.remove(&handle)
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn manifest(&self, handle: u32) -> Result<ModelManifest> {
        self.model(handle)
            .map(NativeModel::manifest)
            .ok_or_else(|| unknown_handle(handle))
    }

    fn get_mut(&mut self, handle: u32) -> Result<&mut NativeModel> {
        self.models.get_mut(&handle).ok_or_else(|| unknown_handle(handle))
    }

    /// Model that still accepts submissions
    fn open_mut(&mut self, handle: u32) -> Result<&mut NativeModel> {
        let model = self.get_mut(handle)?;
        if model.initialized {
            return Err(Error::Runtime(format!("model {} is already initialized", handle)));
        }
        Ok(model)
    }

    fn push_weight(&mut self, handle: u32, weight: NativeWeight) -> Result<()> {
        let model = self.open_mut(handle)?;
        if !model.weight_names.insert(weight.name.clone()) {
            return Err(Error::Runtime(format!("duplicate weight {}", weight.name)));
        }
        model.weights.push(weight);
        Ok(())
    }
}

fn unknown_handle(handle: u32) -> Error {
    Error::InvalidArgument(format!("Invalid model handle: {}", handle))
}

fn check_shape(name: &str, shape: &[i32]) -> Result<usize> {
    if shape.is_empty() || shape.iter().any(|&d| d <= 0) {
        return Err(Error::InvalidArgument(format!("{}: bad shape {:?}", name, shape)));
    }
    shape
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d as usize))
        .ok_or_else(|| Error::InvalidArgument(format!("{}: shape {:?} is too large", name, shape)))
}

impl NativeRuntime for MemoryRuntime {
    type Handle = u32;

    fn create_model(&mut self, family: &str) -> Result<u32> {
        let id = self.next_id;
        self.next_id += 1;
        self.models.insert(id, NativeModel { family: family.to_string(), ..Default::default() });
        log::debug!("Created model {} ({})", id, family);
        Ok(id)
    }

    fn set_config(&mut self, handle: u32, key: &str, value: &str) -> Result<()> {
        self.open_mut(handle)?.config.set(key, value);
        Ok(())
    }

    fn set_adapter_config(&mut self, handle: u32, adapter: &str, key: &str, value: &str) -> Result<()> {
        let model = self.open_mut(handle)?;
        match model.adapters.iter_mut().find(|(n, _)| n == adapter) {
            Some((_, block)) => block.set(key, value),
            None => {
                let mut block = ConfigBlock::new();
                block.set(key, value);
                model.adapters.push((adapter.to_string(), block));
            }
        }
        Ok(())
    }

    fn set_active_adapter(&mut self, handle: u32, adapter: &str) -> Result<()> {
        let model = self.open_mut(handle)?;
        if model.adapter(adapter).is_none() {
            return Err(Error::Runtime(format!("unknown adapter {}", adapter)));
        }
        model.active_adapter = Some(adapter.to_string());
        Ok(())
    }

    fn add_vocab_entry(&mut self, handle: u32, bytes: &[u8], id: i32, score: f32) -> Result<()> {
        let id = u32::try_from(id)
            .map_err(|_| Error::InvalidArgument(format!("negative token id {}", id)))?;
        self.open_mut(handle)?.vocab.push(VocabEntry { bytes: bytes.to_vec(), id, score });
        Ok(())
    }

    fn set_special_tokens(
        &mut self,
        handle: u32,
        lengths: &[i32],
        bytes: &[u8],
        ids: &[i32],
    ) -> Result<()> {
        if lengths.len() != ids.len() {
            return Err(Error::InvalidArgument(format!(
                "{} special token lengths but {} ids",
                lengths.len(),
                ids.len()
            )));
        }
        let to_u32 = |v: &[i32]| -> Result<Vec<u32>> {
            v.iter()
                .map(|&x| {
                    u32::try_from(x)
                        .map_err(|_| Error::InvalidArgument(format!("negative value {}", x)))
                })
                .collect()
        };
        let set = SpecialTokenSet { text: bytes.to_vec(), lengths: to_u32(lengths)?, ids: to_u32(ids)? };
        set.split().map_err(|e| Error::InvalidArgument(e.to_string()))?;
        self.open_mut(handle)?.special_tokens = Some(set);
        Ok(())
    }

    fn add_weight(
        &mut self,
        handle: u32,
        name: &str,
        shape: &[i32],
        target_dtype: Precision,
        kind: WeightKind,
        source_dtype: Precision,
        data: &[u8],
    ) -> Result<()> {
        let numel = check_shape(name, shape)?;
        let width = source_dtype.element_size().ok_or_else(|| {
            Error::InvalidArgument(format!("{}: cannot read a {} buffer", name, source_dtype))
        })?;
        if numel.checked_mul(width) != Some(data.len()) {
            return Err(Error::InvalidArgument(format!(
                "{}: {} bytes for {} elements of {}",
                name,
                data.len(),
                numel,
                source_dtype
            )));
        }
        let weight = NativeWeight {
            name: name.to_string(),
            shape: shape.to_vec(),
            kind,
            target_dtype,
            source_dtype,
            bit_width: None,
            size_bytes: data.len(),
            data: self.retain_payloads.then(|| data.to_vec()),
            scales: None,
        };
        self.push_weight(handle, weight)
    }

    fn add_quantized_weight(
        &mut self,
        handle: u32,
        name: &str,
        shape: &[i32],
        bit_width: u8,
        scales: &[f32],
        packed: &[u8],
    ) -> Result<()> {
        let numel = check_shape(name, shape)?;
        if packed.len() != numel || scales.len() != shape[0] as usize {
            return Err(Error::InvalidArgument(format!(
                "{}: {} packed bytes and {} scales for shape {:?}",
                name,
                packed.len(),
                scales.len(),
                shape
            )));
        }
        let dtype = if bit_width == 4 { Precision::Int4 } else { Precision::Int8 };
        let weight = NativeWeight {
            name: name.to_string(),
            shape: shape.to_vec(),
            kind: WeightKind::QuantizedLinear,
            target_dtype: dtype,
            source_dtype: dtype,
            bit_width: Some(bit_width),
            size_bytes: packed.len() + scales.len() * 4,
            data: self.retain_payloads.then(|| packed.to_vec()),
            scales: Some(scales.to_vec()),
        };
        self.push_weight(handle, weight)
    }

    fn init_params(&mut self, handle: u32) -> Result<()> {
        let model = self.open_mut(handle)?;
        model.initialized = true;
        log::debug!("Initialized model {} with {} weights", handle, model.weights.len());
        Ok(())
    }

    fn warmup(&mut self, handle: u32) -> Result<()> {
        let model = self.get_mut(handle)?;
        if !model.initialized {
            return Err(Error::Runtime(format!("model {} warmed up before init", handle)));
        }
        if model.warmed_up {
            return Err(Error::Runtime(format!("model {} already warmed up", handle)));
        }
        model.warmed_up = true;
        Ok(())
    }
}
