//! Model family profiles
//!
//! A profile shapes the converter's inputs for one model family: extra
//! config entries, tokenizer adjustments and per-tensor hints. Families
//! without a profile use the default, which changes nothing.

use serde_json::Value;
use std::collections::HashMap;
use weightline_core::byte_level::ByteLevelCodec;
use weightline_core::config::{ConfigBlock, ConfigMap};
use weightline_core::error::{Error, Result};
use weightline_core::source::ModelCapabilities;
use weightline_core::tokenizer::{PieceEncoding, TokenizerSource, Vocabulary};

pub const DEFAULT_FAMILY: &str = "default";

/// Vocabulary size of the second Baichuan generation
const BAICHUAN2_VOCAB_SIZE: u64 = 125696;

/// What a profile may look at
pub struct FamilyContext<'a> {
    pub config: &'a ConfigMap,
    pub generation_config: Option<&'a ConfigMap>,
    pub capabilities: ModelCapabilities,
    pub tokenizer: Option<&'a TokenizerSource>,
}

impl<'a> FamilyContext<'a> {
    /// Value from the generation config, falling back to the model config
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.generation_config
            .and_then(|g| g.get(key))
            .or_else(|| self.config.get(key))
    }

    pub fn require_u64(&self, key: &str) -> Result<u64> {
        self.get(key)
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::MissingField(key.to_string()))
    }

    pub fn require_token(&self, token: &str) -> Result<u32> {
        self.tokenizer
            .and_then(|t| t.token_id(token))
            .ok_or_else(|| Error::MissingField(format!("tokenizer token {}", token)))
    }
}

/// Per-tensor adjustments requested by a profile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TensorHints {
    /// Tensors to L2-normalize by row before narrowing
    pub normalize_rows: Vec<String>,
}

impl TensorHints {
    pub fn normalizes(&self, name: &str) -> bool {
        self.normalize_rows.iter().any(|n| n == name)
    }
}

#[derive(Clone, Copy)]
pub struct FamilyProfile {
    pub name: &'static str,
    pub derive_config: fn(&FamilyContext<'_>, &mut ConfigBlock),
    pub adjust_tokenizer: fn(&mut TokenizerSource),
    pub tensor_hints: fn(&FamilyContext<'_>) -> TensorHints,
}

impl std::fmt::Debug for FamilyProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FamilyProfile").field("name", &self.name).finish()
    }
}

fn no_config(_: &FamilyContext<'_>, _: &mut ConfigBlock) {}

fn no_tokenizer_change(_: &mut TokenizerSource) {}

fn no_hints(_: &FamilyContext<'_>) -> TensorHints {
    TensorHints::default()
}

impl FamilyProfile {
    pub const fn plain(name: &'static str) -> Self {
        Self {
            name,
            derive_config: no_config,
            adjust_tokenizer: no_tokenizer_change,
            tensor_hints: no_hints,
        }
    }
}

/// Log a failed lookup and fall back to `default`
fn or_warn<T>(family: &str, result: Result<T>, default: T) -> T {
    match result {
        Ok(v) => v,
        Err(e) => {
            debug_assert!(e.is_recoverable());
            log::warn!("{}: {}, using default", family, e);
            default
        }
    }
}

fn fix_token(id: u64) -> String {
    format!("<FLM_FIX_TOKEN_{}>", id)
}

fn baichuan_config(ctx: &FamilyContext<'_>, block: &mut ConfigBlock) {
    if ctx.capabilities.alibi_mask {
        block.set("use_alibi", "1");
    }
    let second_generation = ctx.require_u64("vocab_size").ok() == Some(BAICHUAN2_VOCAB_SIZE);

    let user = or_warn("baichuan", ctx.require_u64("user_token_id").map(Some), None);
    let user_role = match user {
        Some(id) if second_generation => fix_token(id),
        Some(id) => format!("{} ", fix_token(id)),
        None => String::new(),
    };
    let bot = or_warn("baichuan", ctx.require_u64("assistant_token_id").map(Some), None);

    block.set("pre_prompt", "");
    block.set("user_role", user_role);
    block.set("bot_role", bot.map(fix_token).unwrap_or_default());
    block.set("history_sep", "");
}

fn baichuan_hints(ctx: &FamilyContext<'_>) -> TensorHints {
    let mut hints = TensorHints::default();
    if ctx.require_u64("vocab_size").ok() == Some(BAICHUAN2_VOCAB_SIZE) {
        hints.normalize_rows.push("lm_head.weight".to_string());
    }
    hints
}

fn qwen_config(ctx: &FamilyContext<'_>, block: &mut ConfigBlock) {
    if ctx.get("chat_format").and_then(Value::as_str) != Some("chatml") {
        return;
    }
    let ids = ctx
        .require_token("<|im_start|>")
        .and_then(|start| Ok((start, ctx.require_token("<|im_end|>")?)));
    if let Some((start, end)) = or_warn("qwen", ids.map(Some), None) {
        block.set("im_start_id", start.to_string());
        block.set("im_end_id", end.to_string());
    }
}

/// Pieces become the raw bytes they stand for, all scored 1.0
fn qwen_tokenizer(tokenizer: &mut TokenizerSource) {
    if tokenizer.piece_encoding == PieceEncoding::ByteLevel {
        let codec = ByteLevelCodec::new();
        let decode = |p: &mut Vec<u8>| {
            let bytes = codec.decode(&String::from_utf8_lossy(p));
            *p = bytes;
        };
        match &mut tokenizer.vocab {
            Vocabulary::Scored(v) => v.iter_mut().for_each(|(p, _, _)| decode(p)),
            Vocabulary::Mapped(v) => v.iter_mut().for_each(|(p, _)| decode(p)),
        }
    }
    tokenizer.piece_encoding = PieceEncoding::RawBytes;
    tokenizer.merges = None;
    tokenizer.set_uniform_score(1.0);
}

fn chatglm_config(ctx: &FamilyContext<'_>, block: &mut ConfigBlock) {
    let (Ok(user), Ok(assistant)) =
        (ctx.require_token("<|user|>"), ctx.require_token("<|assistant|>"))
    else {
        return;
    };
    block.set("pre_prompt", "");
    block.set("user_role", format!("{} \n", fix_token(u64::from(user))));
    block.set("bot_role", fix_token(u64::from(assistant)));
    block.set("history_sep", "");
}

fn moss_tokenizer(tokenizer: &mut TokenizerSource) {
    tokenizer.piece_encoding = PieceEncoding::ByteLevel;
}

fn minicpm_config(_: &FamilyContext<'_>, block: &mut ConfigBlock) {
    block.set("model_type", "minicpm");
}

/// Family tag to profile
#[derive(Debug, Clone)]
pub struct FamilyRegistry {
    profiles: HashMap<String, FamilyProfile>,
    fallback: FamilyProfile,
}

impl Default for FamilyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl FamilyRegistry {
    /// Registry with only the default profile
    pub fn empty() -> Self {
        Self { profiles: HashMap::new(), fallback: FamilyProfile::plain(DEFAULT_FAMILY) }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(FamilyProfile {
            derive_config: baichuan_config,
            tensor_hints: baichuan_hints,
            ..FamilyProfile::plain("baichuan")
        });
        registry.register(FamilyProfile {
            derive_config: qwen_config,
            adjust_tokenizer: qwen_tokenizer,
            ..FamilyProfile::plain("qwen")
        });
        registry.register(FamilyProfile {
            derive_config: chatglm_config,
            ..FamilyProfile::plain("chatglm")
        });
        registry.register(FamilyProfile {
            adjust_tokenizer: moss_tokenizer,
            ..FamilyProfile::plain("moss")
        });
        registry.register(FamilyProfile {
            derive_config: minicpm_config,
            ..FamilyProfile::plain("minicpm")
        });
        registry
    }

    pub fn register(&mut self, profile: FamilyProfile) {
        self.profiles.insert(profile.name.to_string(), profile);
    }

    /// Profile for `family`, or the default profile
    pub fn get(&self, family: &str) -> &FamilyProfile {
        self.profiles.get(family).unwrap_or(&self.fallback)
    }

    pub fn contains(&self, family: &str) -> bool {
        self.profiles.contains_key(family)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Family tag of a model config: its `model_type`, with architecture aliases
pub fn detect_family(config: &ConfigMap) -> Result<String> {
    let architectures = config.get("architectures").and_then(Value::as_array);
    if let Some([Value::String(arch)]) = architectures.map(Vec::as_slice) {
        if arch == "MiniCPMForCausalLM" {
            return Ok("minicpm".to_string());
        }
    }
    config
        .get("model_type")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::MissingField("model_type".into()))
}
