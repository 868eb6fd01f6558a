//! weightline bridge to a native inference runtime
//!
//! The native engine is reached only through `NativeRuntime`. `ModelAssembly`
//! drives one model handle through the submission protocol and `Converter`
//! glues checkpoint readers, family profiles and the assembly together.

mod assembly;
mod context;
mod convert;
mod family;
#[cfg(feature = "native")]
mod ffi;

pub use assembly::{AssemblyState, ModelAssembly};
pub use context::{MemoryRuntime, ModelManifest, NativeModel, NativeWeight, WeightSummary};
pub use convert::{ConversionReport, ConvertOptions, Converter, ADAPTER_WEIGHT_PREFIX};
pub use family::{
    detect_family, FamilyContext, FamilyProfile, FamilyRegistry, TensorHints, DEFAULT_FAMILY,
};
#[cfg(feature = "native")]
pub use ffi::FfiRuntime;

use std::fmt;
use weightline_core::error::{Error, Result};
use weightline_core::tensor::{Precision, WeightKind};

/// Runtime version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Stable numeric error codes, also used as process exit status
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok = 0,
    GenericFailure = 1,
    InvalidArgument = 3,
    ModelParseError = 4,
    IoError = 7,
    UnsupportedDType = 8,
    ShapeMismatch = 9,
    AmbiguousEncoding = 10,
    MissingField = 11,
    ProtocolViolation = 12,
    RuntimeFailure = 13,
}

impl From<&Error> for ErrorCode {
    fn from(e: &Error) -> Self {
        match e {
            Error::UnsupportedDType(_) => ErrorCode::UnsupportedDType,
            Error::ShapeMismatch(_) => ErrorCode::ShapeMismatch,
            Error::AmbiguousEncoding(_) => ErrorCode::AmbiguousEncoding,
            Error::MissingField(_) => ErrorCode::MissingField,
            Error::ProtocolViolation(_) => ErrorCode::ProtocolViolation,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::InvalidFormat(_) | Error::Json(_) => ErrorCode::ModelParseError,
            Error::Runtime(_) => ErrorCode::RuntimeFailure,
            Error::Io(_) => ErrorCode::IoError,
        }
    }
}

impl From<Error> for ErrorCode {
    fn from(e: Error) -> Self {
        ErrorCode::from(&e)
    }
}

/// Entry points of a native inference engine.
///
/// Strings cross as bytes, integers as `i32`, scores as `f32`. A handle is
/// opaque; the runtime owns everything submitted to it.
pub trait NativeRuntime {
    type Handle: Copy + fmt::Debug;

    fn create_model(&mut self, family: &str) -> Result<Self::Handle>;

    fn set_config(&mut self, handle: Self::Handle, key: &str, value: &str) -> Result<()>;

    fn set_adapter_config(
        &mut self,
        handle: Self::Handle,
        adapter: &str,
        key: &str,
        value: &str,
    ) -> Result<()>;

    fn set_active_adapter(&mut self, handle: Self::Handle, adapter: &str) -> Result<()>;

    fn add_vocab_entry(&mut self, handle: Self::Handle, bytes: &[u8], id: i32, score: f32)
        -> Result<()>;

    /// `bytes` is every token concatenated; `lengths` and `ids` are parallel
    fn set_special_tokens(
        &mut self,
        handle: Self::Handle,
        lengths: &[i32],
        bytes: &[u8],
        ids: &[i32],
    ) -> Result<()>;

    #[allow(clippy::too_many_arguments)]
    fn add_weight(
        &mut self,
        handle: Self::Handle,
        name: &str,
        shape: &[i32],
        target_dtype: Precision,
        kind: WeightKind,
        source_dtype: Precision,
        data: &[u8],
    ) -> Result<()>;

    fn add_quantized_weight(
        &mut self,
        handle: Self::Handle,
        name: &str,
        shape: &[i32],
        bit_width: u8,
        scales: &[f32],
        packed: &[u8],
    ) -> Result<()>;

    fn init_params(&mut self, handle: Self::Handle) -> Result<()>;

    fn warmup(&mut self, handle: Self::Handle) -> Result<()>;
}
