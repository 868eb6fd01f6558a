/// Bindings to the native inference engine
///
/// The engine exports a flat C API keyed by an integer model handle. None of
/// its entry points report errors, so the only failures surfaced here are
/// arguments that cannot be expressed on the C side.
use crate::NativeRuntime;
use std::ffi::CString;
use std::os::raw::{c_char, c_float, c_int, c_void};
use weightline_core::error::{Error, Result};
use weightline_core::tensor::{Precision, WeightKind};

#[link(name = "fastllm_tools")]
extern "C" {
    fn create_empty_llm_model(model_type: *const c_char) -> c_int;

    fn add_dict_llm_model(model: c_int, key: *const c_char, value: *const c_char);

    fn add_adapter_dict_llm_model(
        model: c_int,
        adapter_name: *const c_char,
        key: *const c_char,
        value: *const c_char,
    );

    fn set_adapter(model: c_int, adapter_name: *const c_char);

    fn add_tokenizer_word_llm_model(
        model: c_int,
        key: *const c_char,
        token_id: c_int,
        score: c_float,
    );

    fn set_special_tokens_llm_model(
        model: c_int,
        token_cnt: c_int,
        lens: *const c_int,
        tokens: *const c_char,
        ids: *const c_int,
    );

    fn add_weight_llm_model(
        model: c_int,
        key: *const c_char,
        dim_len: c_int,
        dim_data: *const c_int,
        data_type: c_int,
        weight_type: c_int,
        ori_data_type: c_int,
        data: *const c_void,
    );

    fn add_qlinear_weight_llm_model(
        model: c_int,
        key: *const c_char,
        dim_len: c_int,
        dim_data: *const c_int,
        bit: c_int,
        scales: *const c_void,
        data: *const c_void,
    );

    fn init_params_llm_model(model: c_int);

    fn warmup_llm_model(model: c_int);
}

/// Runtime backed by the linked native engine
#[derive(Debug, Default)]
pub struct FfiRuntime {
    _private: (),
}

impl FfiRuntime {
    pub fn new() -> Self {
        Self::default()
    }
}

fn c_string(what: &str, bytes: impl Into<Vec<u8>>) -> Result<CString> {
    CString::new(bytes)
        .map_err(|e| Error::InvalidArgument(format!("{} contains a NUL byte at {}", what, e.nul_position())))
}

/// Vocabulary pieces go over a NUL-terminated ABI, so a piece holding a NUL
/// byte is cut at the first one. The id is still registered.
fn vocab_c_string(bytes: &[u8], id: i32) -> CString {
    match CString::new(bytes) {
        Ok(piece) => piece,
        Err(e) => {
            let nul = e.nul_position();
            let mut kept = e.into_vec();
            log::warn!("vocabulary piece {} holds a NUL byte; submitting its first {} bytes", id, nul);
            kept.truncate(nul);
            CString::new(kept).unwrap_or_default()
        }
    }
}

fn c_len(len: usize) -> Result<c_int> {
    c_int::try_from(len).map_err(|_| Error::InvalidArgument(format!("length {} exceeds i32", len)))
}

impl NativeRuntime for FfiRuntime {
    type Handle = c_int;

    fn create_model(&mut self, family: &str) -> Result<c_int> {
        let family = c_string("model type", family)?;
        // SAFETY: `family` is a valid NUL-terminated string for the call.
        let handle = unsafe { create_empty_llm_model(family.as_ptr()) };
        if handle < 0 {
            return Err(Error::Runtime(format!("native engine returned handle {}", handle)));
        }
        Ok(handle)
    }

    fn set_config(&mut self, handle: c_int, key: &str, value: &str) -> Result<()> {
        let key = c_string("config key", key)?;
        let value = c_string("config value", value)?;
        // SAFETY: both strings outlive the call.
        unsafe { add_dict_llm_model(handle, key.as_ptr(), value.as_ptr()) };
        Ok(())
    }

    fn set_adapter_config(&mut self, handle: c_int, adapter: &str, key: &str, value: &str) -> Result<()> {
        let adapter = c_string("adapter name", adapter)?;
        let key = c_string("adapter key", key)?;
        let value = c_string("adapter value", value)?;
        // SAFETY: all strings outlive the call.
        unsafe { add_adapter_dict_llm_model(handle, adapter.as_ptr(), key.as_ptr(), value.as_ptr()) };
        Ok(())
    }

    fn set_active_adapter(&mut self, handle: c_int, adapter: &str) -> Result<()> {
        let adapter = c_string("adapter name", adapter)?;
        // SAFETY: `adapter` outlives the call.
        unsafe { set_adapter(handle, adapter.as_ptr()) };
        Ok(())
    }

    fn add_vocab_entry(&mut self, handle: c_int, bytes: &[u8], id: i32, score: f32) -> Result<()> {
        let piece = vocab_c_string(bytes, id);
        // SAFETY: `piece` outlives the call.
        unsafe { add_tokenizer_word_llm_model(handle, piece.as_ptr(), id, score) };
        Ok(())
    }

    fn set_special_tokens(&mut self, handle: c_int, lengths: &[i32], bytes: &[u8], ids: &[i32]) -> Result<()> {
        if lengths.len() != ids.len() {
            return Err(Error::InvalidArgument(format!(
                "{} special token lengths but {} ids",
                lengths.len(),
                ids.len()
            )));
        }
        let count = c_len(lengths.len())?;
        let text = c_string("special tokens", bytes)?;
        // SAFETY: `lengths` and `ids` hold `count` elements and `text` is
        // NUL-terminated; the engine copies all three before returning.
        unsafe {
            set_special_tokens_llm_model(handle, count, lengths.as_ptr(), text.as_ptr(), ids.as_ptr())
        };
        Ok(())
    }

    fn add_weight(
        &mut self,
        handle: c_int,
        name: &str,
        shape: &[i32],
        target_dtype: Precision,
        kind: WeightKind,
        source_dtype: Precision,
        data: &[u8],
    ) -> Result<()> {
        let key = c_string("weight name", name)?;
        let ndim = c_len(shape.len())?;
        // SAFETY: `shape` holds `ndim` dims and `data` holds the full buffer
        // for that shape in `source_dtype`; the engine copies it.
        unsafe {
            add_weight_llm_model(
                handle,
                key.as_ptr(),
                ndim,
                shape.as_ptr(),
                target_dtype.native_code(),
                kind.native_code(),
                source_dtype.native_code(),
                data.as_ptr() as *const c_void,
            )
        };
        Ok(())
    }

    fn add_quantized_weight(
        &mut self,
        handle: c_int,
        name: &str,
        shape: &[i32],
        bit_width: u8,
        scales: &[f32],
        packed: &[u8],
    ) -> Result<()> {
        let key = c_string("weight name", name)?;
        let ndim = c_len(shape.len())?;
        // SAFETY: `scales` holds one f32 per output channel and `packed` one
        // byte per element of `shape`; the engine copies both.
        unsafe {
            add_qlinear_weight_llm_model(
                handle,
                key.as_ptr(),
                ndim,
                shape.as_ptr(),
                c_int::from(bit_width),
                scales.as_ptr() as *const c_void,
                packed.as_ptr() as *const c_void,
            )
        };
        Ok(())
    }

    fn init_params(&mut self, handle: c_int) -> Result<()> {
        // SAFETY: plain integer argument.
        unsafe { init_params_llm_model(handle) };
        Ok(())
    }

    fn warmup(&mut self, handle: c_int) -> Result<()> {
        // SAFETY: plain integer argument.
        unsafe { warmup_llm_model(handle) };
        Ok(())
    }
}
