/// Converts in-memory models into the reference runtime
use serde_json::{json, Value};
use weightline_bridge::{
    AssemblyState, ConvertOptions, Converter, MemoryRuntime, ModelAssembly, NativeRuntime,
};
use weightline_core::{
    AdapterConfig, ConfigBlock, ConfigMap, Error, InMemoryModel, ModelCapabilities,
    NormalizerFlags, Precision, Result, SourceModel, SourceParameter, SourceTensor, SpecialTokens,
    TemplateStrings, TokenizerSource, VocabEntry, WeightKind, WeightRecordBuilder, WeightRole,
};

fn map(value: Value) -> ConfigMap {
    match value {
        Value::Object(m) => m,
        _ => panic!("not an object"),
    }
}

fn toy_model() -> InMemoryModel {
    InMemoryModel::new(map(json!({"model_type": "llama", "hidden_size": 4})))
        .with_parameter(SourceParameter::new(
            SourceTensor::from_f32("layers.0.q_proj.weight", vec![4, 4], &[0.25; 16]),
            Some(WeightRole::Linear),
        ))
        .with_parameter(SourceParameter::new(
            SourceTensor::from_f32("embed_tokens.weight", vec![10, 4], &[0.5; 40]),
            Some(WeightRole::Embedding),
        ))
        .with_parameter(SourceParameter::new(
            SourceTensor::from_f32("layers.0.q_proj.bias", vec![4], &[0.0; 4]),
            None,
        ))
}

fn canonical_tokenizer() -> TokenizerSource {
    let special = SpecialTokens {
        tokens: vec!["<s>".into(), "</s>".into()],
        ids: vec![1, 2],
        bos: Some("<s>".into()),
        eos: Some("</s>".into()),
        ..Default::default()
    };
    TokenizerSource::scored([("<unk>", 0, 0.0), ("<s>", 1, 0.0), ("</s>", 2, 0.0), ("▁a", 3, -1.5)])
        .with_special_tokens(special)
}

#[test]
fn test_toy_model_dtypes_and_kinds() {
    let mut rt = MemoryRuntime::new();
    let mut model = toy_model();
    let options = ConvertOptions { dtype: Precision::Float16, ..Default::default() };
    let report = Converter::new(options).convert(&mut rt, &mut model, None).unwrap();

    assert_eq!(report.family, "llama");
    assert_eq!(report.weights, 3);
    assert_eq!(report.vocab_entries, 0);

    let native = rt.model(report.handle).unwrap();
    assert!(native.initialized && native.warmed_up);

    let bits: Vec<usize> = native
        .weights
        .iter()
        .map(|w| w.source_dtype.element_size().unwrap() * 8)
        .collect();
    assert_eq!(bits, [16, 32, 32]);
    let kinds: Vec<WeightKind> = native.weights.iter().map(|w| w.kind).collect();
    assert_eq!(kinds, [WeightKind::Linear, WeightKind::Embedding, WeightKind::Plain]);
    assert_eq!(native.weights[0].target_dtype, Precision::Float16);
    assert_eq!(native.weights[0].size_bytes, 32);
    assert_eq!(report.payload_bytes, 32 + 160 + 16);

    // the source model has handed over every buffer
    assert!(model.take_parameter("embed_tokens.weight").is_err());
}

#[test]
fn test_config_derivation() {
    let mut rt = MemoryRuntime::new();
    let mut model = toy_model().with_generation_config(map(json!({"hidden_size": 8, "do_sample": true})));
    let tokenizer = canonical_tokenizer().with_normalizer(NormalizerFlags {
        add_dummy_prefix: true,
        remove_extra_whitespaces: false,
    });
    let options = ConvertOptions {
        templates: TemplateStrings {
            user_role: Some("<s>User: ".into()),
            history_sep: Some(String::new()),
            ..Default::default()
        },
        ..Default::default()
    };
    let report = Converter::new(options).convert(&mut rt, &mut model, Some(tokenizer)).unwrap();
    let config = &rt.model(report.handle).unwrap().config;

    assert_eq!(config.get("model_type"), Some("llama"));
    assert_eq!(config.get("hidden_size"), Some("8"));
    assert_eq!(config.get("do_sample"), Some("True"));
    assert_eq!(config.get("user_role"), Some("<s>User: "));
    assert!(!config.contains("history_sep"));
    assert_eq!(config.get("tokenizer_use_score"), Some("1"));
    assert_eq!(config.get("tokenizer_has_special_tokens"), Some("1"));
    assert_eq!(config.get("tokenizer_add_dummy_prefix"), Some("True"));
    assert_eq!(config.get("tokenizer_remove_extra_whitespaces"), Some("False"));
    // the key keeps its first position after the generation config overrides it
    assert_eq!(config.entries()[1].key, "hidden_size");

    assert_eq!(report.vocab_entries, 4);
    assert_eq!(report.special_tokens, 2);
    let special = rt.model(report.handle).unwrap().special_tokens.as_ref().unwrap();
    assert_eq!(special.split().unwrap(), [&b"<s>"[..], &b"</s>"[..]]);
}

#[test]
fn test_canonical_special_tokens_not_registered() {
    let mut rt = MemoryRuntime::new();
    let report = Converter::default()
        .convert(&mut rt, &mut toy_model(), Some(canonical_tokenizer()))
        .unwrap();

    let native = rt.model(report.handle).unwrap();
    assert!(!native.config.contains("tokenizer_has_special_tokens"));
    assert!(native.special_tokens.is_none());
    assert_eq!(native.vocab.len(), 4);
    assert_eq!(native.vocab[3], VocabEntry { bytes: "▁a".as_bytes().to_vec(), id: 3, score: -1.5 });
}

#[test]
fn test_adapter_prefix_stripped() {
    let mut rt = MemoryRuntime::new();
    let mut model = InMemoryModel::new(map(json!({"model_type": "llama"})))
        .with_adapter(AdapterConfig::from_map("default", &map(json!({"r": 8, "lora_alpha": 16}))))
        .with_active_adapter("default")
        .with_parameter(SourceParameter::new(
            SourceTensor::from_f32("base_model.model.lm_head.weight", vec![2, 2], &[1.0; 4]),
            Some(WeightRole::Linear),
        ));

    let report = Converter::default().convert(&mut rt, &mut model, None).unwrap();
    let native = rt.model(report.handle).unwrap();

    assert!(native.weight("lm_head.weight").is_some());
    assert_eq!(native.active_adapter.as_deref(), Some("default"));
    assert_eq!(native.adapter("default").unwrap().get("lora_alpha"), Some("16"));
}

#[test]
fn test_prefix_kept_without_adapters() {
    let mut rt = MemoryRuntime::new();
    let mut model = InMemoryModel::new(map(json!({"model_type": "llama"}))).with_parameter(
        SourceParameter::new(
            SourceTensor::from_f32("base_model.model.lm_head.weight", vec![2, 2], &[1.0; 4]),
            Some(WeightRole::Linear),
        ),
    );
    let report = Converter::default().convert(&mut rt, &mut model, None).unwrap();
    assert!(rt.model(report.handle).unwrap().weight("base_model.model.lm_head.weight").is_some());
}

#[test]
fn test_baichuan2_head_normalized() {
    let mut rt = MemoryRuntime::new();
    let mut model = InMemoryModel::new(map(json!({"model_type": "baichuan", "vocab_size": 125696})))
        .with_generation_config(map(json!({"user_token_id": 195, "assistant_token_id": 196})))
        .with_capabilities(ModelCapabilities { alibi_mask: true })
        .with_parameter(SourceParameter::new(
            SourceTensor::from_f32("lm_head.weight", vec![2, 2], &[3.0, 4.0, 0.0, 2.0]),
            Some(WeightRole::Linear),
        ));
    let options = ConvertOptions { dtype: Precision::Float32, ..Default::default() };
    let report = Converter::new(options).convert(&mut rt, &mut model, None).unwrap();
    let native = rt.model(report.handle).unwrap();

    assert_eq!(native.config.get("use_alibi"), Some("1"));
    assert_eq!(native.config.get("user_role"), Some("<FLM_FIX_TOKEN_195>"));
    let data = native.weight("lm_head.weight").unwrap().data.as_ref().unwrap();
    let values: Vec<f32> = data
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    let expected = [0.6, 0.8, 0.0, 1.0];
    for (v, e) in values.iter().zip(expected) {
        assert!((v - e).abs() < 1e-6, "{} != {}", v, e);
    }
}

#[test]
fn test_family_override() {
    let mut rt = MemoryRuntime::new();
    let mut model = InMemoryModel::new(map(json!({"architectures": ["LlamaForCausalLM"]})))
        .with_parameter(SourceParameter::new(SourceTensor::from_f32("w", vec![1], &[1.0]), None));

    let err = Converter::default().convert(&mut rt, &mut model, None).unwrap_err();
    assert!(matches!(err, Error::MissingField(_)));
    assert_eq!(rt.model_count(), 0);

    let options = ConvertOptions { family: Some("llama".into()), ..Default::default() };
    let report = Converter::new(options).convert(&mut rt, &mut model, None).unwrap();
    assert_eq!(report.model_type, "llama");
    assert_eq!(rt.model(report.handle).unwrap().family, "llama");
}

#[test]
fn test_model_without_weights_is_not_finalized() {
    let mut rt = MemoryRuntime::new();
    let mut model = InMemoryModel::new(map(json!({"model_type": "llama"})));
    let err = Converter::default().convert(&mut rt, &mut model, None).unwrap_err();

    assert!(matches!(err, Error::ProtocolViolation(_)));
    // the partial model is still there to inspect
    let manifest = rt.manifest(1).unwrap();
    assert_eq!(manifest.config[0].value, "llama");
    assert!(!manifest.initialized);
}

fn record(name: &str) -> weightline_core::WeightRecord {
    let p = SourceParameter::new(SourceTensor::from_f32(name, vec![2], &[1.0, 2.0]), None);
    WeightRecordBuilder::new(Precision::Float32).build(p).unwrap()
}

#[test]
fn test_protocol_violations_are_deterministic() {
    let mut rt = MemoryRuntime::new();
    let mut asm = ModelAssembly::create(&mut rt, "llama").unwrap();

    for _ in 0..2 {
        assert!(matches!(asm.load_vocab(&[], None), Err(Error::ProtocolViolation(_))));
        assert!(matches!(asm.finalize(), Err(Error::ProtocolViolation(_))));
        assert_eq!(asm.state(), AssemblyState::Created);
    }

    asm.load_config(&ConfigBlock::new(), &[], None).unwrap();
    assert!(matches!(
        asm.load_config(&ConfigBlock::new(), &[], None),
        Err(Error::ProtocolViolation(_))
    ));
    asm.load_vocab(&[], None).unwrap();
    asm.add_weight(record("a")).unwrap();
    asm.add_weight(record("b")).unwrap();
    asm.finalize().unwrap();

    assert!(matches!(asm.finalize(), Err(Error::ProtocolViolation(_))));
    assert!(matches!(asm.add_weight(record("c")), Err(Error::ProtocolViolation(_))));
    assert_eq!(asm.state(), AssemblyState::Finalized);
    assert_eq!(asm.weight_count(), 2);

    let manifest = rt.manifest(1).unwrap();
    assert_eq!(manifest.weights.len(), 2);
    assert!(manifest.warmed_up);
}

/// Reference runtime that rejects one weight by name
struct RejectingRuntime {
    inner: MemoryRuntime,
    reject: &'static str,
}

impl NativeRuntime for RejectingRuntime {
    type Handle = u32;

    fn create_model(&mut self, family: &str) -> Result<u32> {
        self.inner.create_model(family)
    }

    fn set_config(&mut self, handle: u32, key: &str, value: &str) -> Result<()> {
        self.inner.set_config(handle, key, value)
    }

    fn set_adapter_config(&mut self, handle: u32, adapter: &str, key: &str, value: &str) -> Result<()> {
        self.inner.set_adapter_config(handle, adapter, key, value)
    }

    fn set_active_adapter(&mut self, handle: u32, adapter: &str) -> Result<()> {
        self.inner.set_active_adapter(handle, adapter)
    }

    fn add_vocab_entry(&mut self, handle: u32, bytes: &[u8], id: i32, score: f32) -> Result<()> {
        self.inner.add_vocab_entry(handle, bytes, id, score)
    }

    fn set_special_tokens(&mut self, handle: u32, lengths: &[i32], bytes: &[u8], ids: &[i32]) -> Result<()> {
        self.inner.set_special_tokens(handle, lengths, bytes, ids)
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
        if name == self.reject {
            return Err(Error::Runtime(format!("out of memory loading {}", name)));
        }
        self.inner.add_weight(handle, name, shape, target_dtype, kind, source_dtype, data)
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
        self.inner.add_quantized_weight(handle, name, shape, bit_width, scales, packed)
    }

    fn init_params(&mut self, handle: u32) -> Result<()> {
        self.inner.init_params(handle)
    }

    fn warmup(&mut self, handle: u32) -> Result<()> {
        self.inner.warmup(handle)
    }
}

#[test]
fn test_runtime_failure_aborts() {
    let mut rt = RejectingRuntime { inner: MemoryRuntime::new(), reject: "b" };
    let mut asm = ModelAssembly::create(&mut rt, "llama").unwrap();
    asm.load_config(&ConfigBlock::new(), &[], None).unwrap();
    asm.load_vocab(&[], None).unwrap();
    asm.add_weight(record("a")).unwrap();

    assert!(matches!(asm.add_weight(record("b")), Err(Error::Runtime(_))));
    assert_eq!(asm.state(), AssemblyState::Aborted);
    assert!(matches!(asm.add_weight(record("c")), Err(Error::ProtocolViolation(_))));
    assert!(matches!(asm.finalize(), Err(Error::ProtocolViolation(_))));

    let native = rt.inner.model(1).unwrap();
    assert_eq!(native.weights.len(), 1);
    assert!(!native.initialized);
}

#[test]
fn test_converter_surfaces_runtime_failure() {
    let mut rt = RejectingRuntime { inner: MemoryRuntime::new(), reject: "embed_tokens.weight" };
    let err = Converter::default().convert(&mut rt, &mut toy_model(), None).unwrap_err();
    assert!(matches!(err, Error::Runtime(_)));
    assert_eq!(rt.inner.model(1).unwrap().weights.len(), 1);
}
