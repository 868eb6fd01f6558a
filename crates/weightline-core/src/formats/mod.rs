//! Checkpoint container formats

pub mod safetensors;


