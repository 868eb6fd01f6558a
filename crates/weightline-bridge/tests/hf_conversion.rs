/// Converts Hugging Face style directories written to a temp dir
use serde_json::{json, Value};
use std::fs::{self, File};
use std::path::Path;
use tempfile::TempDir;
use weightline_bridge::{ConvertOptions, Converter, MemoryRuntime};
use weightline_core::{write_safetensors, DataType, HfModelDir, Precision, SourceTensor, WeightKind};

fn write_json(dir: &Path, name: &str, value: Value) {
    fs::write(dir.join(name), serde_json::to_vec_pretty(&value).unwrap()).unwrap();
}

fn write_weights(dir: &Path, name: &str, tensors: &[SourceTensor]) {
    let mut file = File::create(dir.join(name)).unwrap();
    write_safetensors(&mut file, tensors).unwrap();
}

fn f16_tensor(name: &str, shape: Vec<usize>, values: &[f32]) -> SourceTensor {
    let data = values
        .iter()
        .flat_map(|v| half::f16::from_f32(*v).to_le_bytes())
        .collect();
    SourceTensor::new(name, shape, DataType::F16, data)
}

fn moss_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    write_json(
        dir.path(),
        "config.json",
        json!({"model_type": "moss", "n_layer": 1, "tie_word_embeddings": false}),
    );
    write_json(
        dir.path(),
        "tokenizer.json",
        json!({
            "added_tokens": [
                {"id": 5, "content": "<eom>", "special": true},
                {"id": 6, "content": "<eoh>", "special": true}
            ],
            "model": {
                "type": "BPE",
                "vocab": {"h": 0, "i": 1, "hi": 2, "Ġ": 3, "Ġhi": 4},
                "merges": [["h", "i"], ["Ġ", "hi"]]
            }
        }),
    );
    write_json(
        dir.path(),
        "tokenizer_config.json",
        json!({"eos_token": "<eom>", "additional_special_tokens": ["<eoh>"]}),
    );
    write_weights(
        dir.path(),
        "model.safetensors",
        &[
            f16_tensor("transformer.wte.weight", vec![6, 2], &[0.5; 12]),
            f16_tensor("transformer.h.0.attn.qkv_proj.weight", vec![6, 2], &[1.0; 12]),
            f16_tensor("transformer.ln_f.weight", vec![2], &[1.0, 1.0]),
        ],
    );
    dir
}

#[test]
fn test_convert_moss_directory() {
    let dir = moss_dir();
    let hf = HfModelDir::open(dir.path()).unwrap();
    let mut model = hf.load_model().unwrap();
    let tokenizer = hf.load_tokenizer().unwrap();

    let mut rt = MemoryRuntime::without_payloads();
    let report = Converter::default().convert(&mut rt, &mut model, tokenizer).unwrap();
    assert_eq!(report.family, "moss");
    assert_eq!(report.weights, 3);

    let manifest = rt.manifest(report.handle).unwrap();
    assert!(manifest.initialized && manifest.warmed_up);
    assert_eq!(manifest.vocab_size, 7);
    assert_eq!(manifest.special_tokens, 2);

    let config: Vec<(&str, &str)> =
        manifest.config.iter().map(|e| (e.key.as_str(), e.value.as_str())).collect();
    assert!(config.contains(&("tie_word_embeddings", "False")));
    assert!(config.contains(&("tokenizer_has_special_tokens", "1")));

    let wte = &manifest.weights[0];
    assert_eq!(wte.name, "transformer.wte.weight");
    assert_eq!((wte.kind, wte.target_dtype), (WeightKind::Embedding, Precision::Float32));
    assert_eq!(wte.size_bytes, 48);
    let qkv = &manifest.weights[1];
    assert_eq!((qkv.kind, qkv.source_dtype), (WeightKind::Linear, Precision::Float16));
    assert_eq!(manifest.weights[2].kind, WeightKind::Plain);

    // byte-level pieces reach the runtime as real bytes with merge scores
    let native = rt.model(report.handle).unwrap();
    let hi = native.vocab.iter().find(|e| e.id == 4).unwrap();
    assert_eq!((hi.bytes.as_slice(), hi.score), (&b" hi"[..], -1.0));
}

#[test]
fn test_convert_qwen_directory() {
    let dir = TempDir::new().unwrap();
    write_json(dir.path(), "config.json", json!({"model_type": "qwen", "chat_format": "chatml"}));
    write_json(
        dir.path(),
        "tokenizer.json",
        json!({
            "added_tokens": [
                {"id": 3, "content": "<|im_start|>", "special": true},
                {"id": 4, "content": "<|im_end|>", "special": true}
            ],
            "decoder": {"type": "ByteLevel"},
            "model": {"type": "BPE", "vocab": {"a": 0, "Ġa": 1, "b": 2}, "merges": ["Ġ a"]}
        }),
    );
    write_weights(
        dir.path(),
        "model.safetensors",
        &[SourceTensor::from_f32("transformer.h.0.mlp.w1.weight", vec![2, 2], &[1.0; 4])],
    );

    let hf = HfModelDir::open(dir.path()).unwrap();
    let mut model = hf.load_model().unwrap();
    let options = ConvertOptions { dtype: Precision::Int8, ..Default::default() };
    let mut rt = MemoryRuntime::new();
    let report = Converter::new(options)
        .convert(&mut rt, &mut model, hf.load_tokenizer().unwrap())
        .unwrap();

    let native = rt.model(report.handle).unwrap();
    assert_eq!(native.config.get("im_start_id"), Some("3"));
    assert_eq!(native.config.get("im_end_id"), Some("4"));
    assert!(native.vocab.iter().all(|e| e.score == 1.0));
    assert_eq!(native.vocab[1].bytes, b" a");

    // int8 linear layers travel as float32 for the runtime to quantize
    let w1 = native.weight("transformer.h.0.mlp.w1.weight").unwrap();
    assert_eq!((w1.target_dtype, w1.source_dtype), (Precision::Int8, Precision::Float32));
}

#[test]
fn test_convert_quantized_directory() {
    let dir = TempDir::new().unwrap();
    write_json(
        dir.path(),
        "config.json",
        json!({"model_type": "chatglm", "quantization_bit": 4}),
    );
    write_weights(
        dir.path(),
        "model.safetensors",
        &[
            SourceTensor::new("encoder.layers.0.dense.weight", vec![2, 4], DataType::I8, vec![7; 8]),
            f16_tensor("encoder.layers.0.dense.weight_scale", vec![2], &[0.5, 0.25]),
        ],
    );

    let hf = HfModelDir::open(dir.path()).unwrap();
    let mut model = hf.load_model().unwrap();
    let mut rt = MemoryRuntime::new();
    let report = Converter::default().convert(&mut rt, &mut model, None).unwrap();

    let native = rt.model(report.handle).unwrap();
    assert_eq!(native.weights.len(), 1);
    let dense = &native.weights[0];
    assert_eq!(dense.kind, WeightKind::QuantizedLinear);
    assert_eq!(dense.bit_width, Some(4));
    assert_eq!(dense.scales.as_deref(), Some(&[0.5, 0.25][..]));
    assert_eq!(dense.data.as_deref(), Some(&[7u8; 8][..]));
}
