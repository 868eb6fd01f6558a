//! Hugging Face model directory loader
//!
//! Reads `config.json`, `generation_config.json`, `adapter_config.json`,
//! `tokenizer.json`, `tokenizer_config.json` and safetensors weights (single
//! file or sharded index) and exposes them as a `SourceModel` and a
//! `TokenizerSource`. Tensor data is read lazily, one parameter at a time.

use crate::config::{AdapterConfig, ConfigMap};
use crate::error::{Error, Result};
use crate::formats::safetensors::SafetensorsReader;
use crate::source::{ModelCapabilities, SourceModel, SourceParameter, WeightRole};
use crate::tensor::{Shape, SourceTensor};
use crate::tokenizer::{
    MergeList, NormalizerFlags, PieceEncoding, SpecialTokens, TokenizerSource, Vocabulary,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Name fragments marking a token embedding table
pub const EMBEDDING_MARKERS: [&str; 4] = ["embed_tokens", "wte", "word_embeddings", "tok_embeddings"];

/// Suffix of the per-channel scale tensor stored beside a quantized weight
pub const SCALE_SUFFIX: &str = "_scale";

/// Bit width assumed for quantized weights when the config is silent
pub const DEFAULT_QUANTIZATION_BIT: u8 = 8;

/// Name given to the adapter described by `adapter_config.json`
pub const DEFAULT_ADAPTER: &str = "default";

/// Special-token attributes of `tokenizer_config.json`, in listing order
const SPECIAL_TOKEN_KEYS: [&str; 7] =
    ["bos_token", "eos_token", "unk_token", "sep_token", "pad_token", "cls_token", "mask_token"];

type ShardReader = SafetensorsReader<BufReader<File>>;

/// A model directory on disk
#[derive(Debug, Clone)]
pub struct HfModelDir {
    root: PathBuf,
}

impl HfModelDir {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        if !root.join("config.json").is_file() {
            return Err(Error::InvalidFormat(format!(
                "{} has no config.json",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Parse a JSON file of the directory, `None` if it does not exist
    pub fn read_json(&self, name: &str) -> Result<Option<Value>> {
        let path = self.root.join(name);
        if !path.is_file() {
            return Ok(None);
        }
        let file = File::open(&path)?;
        let value = serde_json::from_reader(BufReader::new(file))?;
        Ok(Some(value))
    }

    fn read_object(&self, name: &str) -> Result<Option<ConfigMap>> {
        match self.read_json(name)? {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(_) => Err(Error::InvalidFormat(format!("{} is not a JSON object", name))),
        }
    }

    pub fn config(&self) -> Result<ConfigMap> {
        self.read_object("config.json")?
            .ok_or_else(|| Error::InvalidFormat("config.json disappeared".into()))
    }

    /// Safetensors files holding the weights, in shard order
    pub fn weight_files(&self) -> Result<Vec<PathBuf>> {
        if let Some(index) = self.read_json("model.safetensors.index.json")? {
            let weight_map = index
                .get("weight_map")
                .and_then(Value::as_object)
                .ok_or_else(|| Error::InvalidFormat("index has no weight_map".into()))?;
            let files: BTreeSet<&str> = weight_map.values().filter_map(Value::as_str).collect();
            return Ok(files.into_iter().map(|f| self.root.join(f)).collect());
        }
        let single = self.root.join("model.safetensors");
        if single.is_file() {
            return Ok(vec![single]);
        }
        Err(Error::InvalidFormat(format!(
            "no safetensors weights found in {}",
            self.root.display()
        )))
    }

    pub fn load_model(&self) -> Result<HfModel> {
        let config = self.config()?;
        let generation_config = self.read_object("generation_config.json")?;

        let mut adapters = Vec::new();
        let mut active_adapter = None;
        if let Some(map) = self.read_object("adapter_config.json")? {
            adapters.push(AdapterConfig::from_map(DEFAULT_ADAPTER, &map));
            active_adapter = Some(DEFAULT_ADAPTER.to_string());
        }

        let mut shards = Vec::new();
        for path in self.weight_files()? {
            log::debug!("Reading safetensors header {}", path.display());
            let file = File::open(&path)?;
            shards.push(SafetensorsReader::open(BufReader::new(file))?);
        }

        let bit_width = config
            .get("quantization_bit")
            .and_then(Value::as_u64)
            .and_then(|b| u8::try_from(b).ok())
            .unwrap_or(DEFAULT_QUANTIZATION_BIT);
        let entries = classify(&shards, bit_width);

        let capabilities = ModelCapabilities {
            alibi_mask: config.contains_key("model_max_length")
                && !config.contains_key("max_position_embeddings"),
        };

        log::info!(
            "Opened {} with {} parameters in {} shard(s)",
            self.root.display(),
            entries.len(),
            shards.len()
        );

        Ok(HfModel {
            config,
            generation_config,
            capabilities,
            adapters,
            active_adapter,
            shards,
            entries,
            taken: HashSet::new(),
        })
    }

    /// Tokenizer described by `tokenizer.json`, `None` if the directory has none
    pub fn load_tokenizer(&self) -> Result<Option<TokenizerSource>> {
        let Some(tokenizer) = self.read_json("tokenizer.json")? else {
            return Ok(None);
        };
        let tokenizer_config = self.read_object("tokenizer_config.json")?.unwrap_or_default();
        parse_tokenizer(&tokenizer, &tokenizer_config).map(Some)
    }
}

#[derive(Debug, Clone)]
struct ParamEntry {
    name: String,
    shard: usize,
    role: Option<WeightRole>,
    scale: Option<String>,
}

fn classify(shards: &[ShardReader], bit_width: u8) -> Vec<ParamEntry> {
    let all: HashSet<&str> =
        shards.iter().flat_map(|s| s.tensors().iter().map(|t| t.name.as_str())).collect();
    let scale_names: HashSet<String> = all
        .iter()
        .filter(|name| all.contains(format!("{}{}", name, SCALE_SUFFIX).as_str()))
        .map(|name| format!("{}{}", name, SCALE_SUFFIX))
        .collect();

    let mut entries = Vec::new();
    for (shard, reader) in shards.iter().enumerate() {
        for t in reader.tensors() {
            if scale_names.contains(&t.name) {
                continue;
            }
            let scale = format!("{}{}", t.name, SCALE_SUFFIX);
            let (role, scale) = if all.contains(scale.as_str()) {
                (Some(WeightRole::QuantizedLinear { bit_width }), Some(scale))
            } else {
                (role_for(&t.name, &t.shape), None)
            };
            entries.push(ParamEntry { name: t.name.clone(), shard, role, scale });
        }
    }
    entries
}

/// Role of an unquantized tensor, from its name and shape
pub fn role_for(name: &str, shape: &Shape) -> Option<WeightRole> {
    if shape.ndim() != 2 || !name.ends_with(".weight") {
        return None;
    }
    if EMBEDDING_MARKERS.iter().any(|m| name.contains(m)) {
        Some(WeightRole::Embedding)
    } else {
        Some(WeightRole::Linear)
    }
}

/// A model directory with open weight shards
pub struct HfModel {
    config: ConfigMap,
    generation_config: Option<ConfigMap>,
    capabilities: ModelCapabilities,
    adapters: Vec<AdapterConfig>,
    active_adapter: Option<String>,
    shards: Vec<ShardReader>,
    entries: Vec<ParamEntry>,
    taken: HashSet<String>,
}

impl HfModel {
    fn read(&mut self, shard: usize, name: &str) -> Result<SourceTensor> {
        let reader = self
            .shards
            .get_mut(shard)
            .ok_or_else(|| Error::InvalidArgument(format!("no shard {}", shard)))?;
        let mut tensor = reader.read_tensor(name)?;
        // scalars travel as one-element vectors
        if tensor.shape.ndim() == 0 {
            tensor.shape = Shape::new(vec![1]);
        }
        Ok(tensor)
    }
}

impl SourceModel for HfModel {
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
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    fn take_parameter(&mut self, name: &str) -> Result<SourceParameter> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown parameter: {}", name)))?;
        if !self.taken.insert(entry.name.clone()) {
            return Err(Error::InvalidArgument(format!("Parameter already taken: {}", name)));
        }

        let tensor = self.read(entry.shard, &entry.name)?;
        let scales = match &entry.scale {
            Some(scale) => {
                let shard = self
                    .shards
                    .iter()
                    .position(|s| s.entry(scale).is_some())
                    .ok_or_else(|| Error::MissingField(scale.clone()))?;
                Some(self.read(shard, scale)?)
            }
            None => None,
        };
        Ok(SourceParameter { tensor, role: entry.role, scales, normalize_rows: false })
    }
}

fn parse_tokenizer(tokenizer: &Value, tokenizer_config: &ConfigMap) -> Result<TokenizerSource> {
    let model = tokenizer
        .get("model")
        .ok_or_else(|| Error::MissingField("tokenizer.json: model".into()))?;
    let model_type = model.get("type").and_then(Value::as_str).unwrap_or("BPE");

    let mut vocab = match model_type {
        "Unigram" => {
            let pieces = model
                .get("vocab")
                .and_then(Value::as_array)
                .ok_or_else(|| Error::MissingField("tokenizer.json: model.vocab".into()))?;
            let mut scored = Vec::with_capacity(pieces.len());
            for (id, item) in pieces.iter().enumerate() {
                let piece = item.get(0).and_then(Value::as_str);
                let score = item.get(1).and_then(Value::as_f64);
                match (piece, score) {
                    (Some(piece), Some(score)) => {
                        scored.push((piece.as_bytes().to_vec(), id as u32, score as f32))
                    }
                    _ => {
                        return Err(Error::InvalidFormat(format!(
                            "unigram vocab entry {} is not [piece, score]",
                            id
                        )))
                    }
                }
            }
            Vocabulary::Scored(scored)
        }
        _ => {
            let map = model
                .get("vocab")
                .and_then(Value::as_object)
                .ok_or_else(|| Error::MissingField("tokenizer.json: model.vocab".into()))?;
            let mut mapped = Vec::with_capacity(map.len());
            for (piece, id) in map {
                let id = id
                    .as_u64()
                    .and_then(|id| u32::try_from(id).ok())
                    .ok_or_else(|| Error::InvalidFormat(format!("bad id for piece {:?}", piece)))?;
                mapped.push((piece.as_bytes().to_vec(), id));
            }
            Vocabulary::Mapped(mapped)
        }
    };

    let added = added_tokens(tokenizer);
    if let Vocabulary::Mapped(mapped) = &mut vocab {
        let known: HashSet<u32> = mapped.iter().map(|(_, id)| *id).collect();
        for (content, id, _) in &added {
            if !known.contains(id) {
                mapped.push((content.as_bytes().to_vec(), *id));
            }
        }
    }

    let merges = match model.get("merges").and_then(Value::as_array) {
        Some(items) if model_type == "BPE" => Some(parse_merges(items)?),
        _ => None,
    };

    let piece_encoding = if ["decoder", "pre_tokenizer"]
        .iter()
        .any(|k| tokenizer.get(*k).map_or(false, |v| mentions_type(v, "ByteLevel")))
    {
        PieceEncoding::ByteLevel
    } else {
        PieceEncoding::Text
    };

    let mut source = TokenizerSource::new(vocab);
    source.merges = merges;
    source.piece_encoding = piece_encoding;
    source.special = special_tokens(&source, tokenizer_config, &added);
    source.normalizer = normalizer_flags(tokenizer);

    log::info!(
        "Tokenizer: {} model, {} pieces, {} special tokens, {:?} pieces",
        model_type,
        source.vocab.len(),
        source.special.tokens.len(),
        source.piece_encoding
    );
    Ok(source)
}

fn parse_merges(items: &[Value]) -> Result<MergeList> {
    let mut pairs = Vec::with_capacity(items.len());
    for item in items {
        let pair = match item {
            Value::String(line) => line.split_once(' ').map(|(a, b)| (a.to_string(), b.to_string())),
            Value::Array(parts) => match (parts.first(), parts.get(1)) {
                (Some(Value::String(a)), Some(Value::String(b))) => Some((a.clone(), b.clone())),
                _ => None,
            },
            _ => None,
        };
        let pair =
            pair.ok_or_else(|| Error::InvalidFormat(format!("unreadable merge {}", item)))?;
        pairs.push(pair);
    }
    Ok(MergeList::from_pairs(pairs))
}

/// (content, id, special) of every added token
fn added_tokens(tokenizer: &Value) -> Vec<(String, u32, bool)> {
    tokenizer
        .get("added_tokens")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|t| {
                    let content = t.get("content")?.as_str()?.to_string();
                    let id = u32::try_from(t.get("id")?.as_u64()?).ok()?;
                    let special = t.get("special").and_then(Value::as_bool).unwrap_or(false);
                    Some((content, id, special))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// A token attribute may be a bare string or an added-token object
fn token_text(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => Some(s),
        Value::Object(map) => map.get("content").and_then(Value::as_str),
        _ => None,
    }
}

fn special_tokens(
    source: &TokenizerSource,
    tokenizer_config: &ConfigMap,
    added: &[(String, u32, bool)],
) -> SpecialTokens {
    let added_ids: HashMap<&str, u32> = added.iter().map(|(c, id, _)| (c.as_str(), *id)).collect();
    let lookup = |token: &str| added_ids.get(token).copied().or_else(|| source.token_id(token));

    let attr = |key: &str| tokenizer_config.get(key).and_then(token_text).map(str::to_string);
    let mut special = SpecialTokens {
        bos: attr("bos_token"),
        eos: attr("eos_token"),
        unk: attr("unk_token"),
        pad: attr("pad_token"),
        ..Default::default()
    };

    let additional = tokenizer_config
        .get("additional_special_tokens")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(token_text).map(str::to_string).collect::<Vec<_>>())
        .unwrap_or_default();
    let declared = SPECIAL_TOKEN_KEYS.iter().filter_map(|k| attr(*k)).chain(additional);

    for token in declared {
        match lookup(&token) {
            Some(id) => special.push(token, id),
            None => log::warn!("Special token {:?} has no id, skipping", token),
        }
    }

    if special.is_empty() {
        for (content, id, is_special) in added {
            if *is_special {
                special.push(content.as_str(), *id);
            }
        }
    }
    special
}

/// Sentencepiece-style normalization shows up as a `Prepend("▁")`
/// normalizer or a `Metaspace` pre-tokenizer that adds a prefix space.
/// Collapsing runs of spaces is a `Replace` of `" {2,}"` in the normalizer.
fn normalizer_flags(tokenizer: &Value) -> Option<NormalizerFlags> {
    let normalizer = tokenizer.get("normalizer");
    let prepends = normalizer.map_or(false, |n| find_typed(n, "Prepend").is_some());
    let collapses = normalizer.map_or(false, collapses_spaces);
    let metaspace = tokenizer.get("pre_tokenizer").and_then(|p| find_typed(p, "Metaspace"));

    let add_dummy_prefix = prepends
        || metaspace.map_or(false, |m| {
            m.get("add_prefix_space").and_then(Value::as_bool).unwrap_or(false)
                || m.get("prepend_scheme").and_then(Value::as_str).map_or(false, |s| s != "never")
        });
    if !prepends && !collapses && metaspace.is_none() {
        return None;
    }
    Some(NormalizerFlags { add_dummy_prefix, remove_extra_whitespaces: collapses })
}

fn collapses_spaces(value: &Value) -> bool {
    let Value::Object(map) = value else {
        return false;
    };
    let pattern = map.get("pattern").and_then(|p| p.get("Regex")).and_then(Value::as_str);
    if map.get("type").and_then(Value::as_str) == Some("Replace") && pattern == Some(" {2,}") {
        return true;
    }
    map.get("normalizers")
        .and_then(Value::as_array)
        .map_or(false, |children| children.iter().any(collapses_spaces))
}

fn mentions_type(value: &Value, ty: &str) -> bool {
    find_typed(value, ty).is_some()
}

/// First object in a (possibly nested `Sequence`) component with `"type": ty`
fn find_typed<'a>(value: &'a Value, ty: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => {
            if map.get("type").and_then(Value::as_str) == Some(ty) {
                return Some(value);
            }
            ["normalizers", "pretokenizers", "decoders"]
                .iter()
                .filter_map(|k| map.get(*k).and_then(Value::as_array))
                .flatten()
                .find_map(|child| find_typed(child, ty))
        }
        _ => None,
    }
}
