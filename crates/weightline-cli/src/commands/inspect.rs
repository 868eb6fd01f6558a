//! Inspect command: describe a model directory without converting it

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use weightline_bridge::{detect_family, FamilyRegistry, DEFAULT_FAMILY};
use weightline_core::{HfModelDir, SourceModel};

#[derive(Args)]
pub struct InspectCommand {
    /// Hugging Face model directory
    pub model_dir: PathBuf,

    /// List every parameter name
    #[arg(long)]
    pub parameters: bool,
}

pub fn execute(cmd: InspectCommand) -> Result<()> {
    let dir = HfModelDir::open(&cmd.model_dir)
        .with_context(|| format!("opening model directory {}", cmd.model_dir.display()))?;
    let model = dir.load_model().context("reading model weights")?;

    let family = detect_family(model.config())?;
    let registry = FamilyRegistry::builtin();
    let profile = if registry.contains(&family) { family.as_str() } else { DEFAULT_FAMILY };
    println!("Family:      {} (profile {})", family, profile);
    println!("Config keys: {}", model.config().len());
    if let Some(generation) = model.generation_config() {
        println!("Generation:  {} keys", generation.len());
    }
    if model.capabilities().alibi_mask {
        println!("Positions:   alibi");
    }
    for adapter in model.adapters() {
        let active = if model.active_adapter() == Some(adapter.name.as_str()) { " (active)" } else { "" };
        println!("Adapter:     {}{} with {} keys", adapter.name, active, adapter.entries.len());
    }

    let names = model.parameter_names();
    println!("Parameters:  {}", names.len());
    if cmd.parameters {
        for name in &names {
            println!("  {}", name);
        }
    }

    match dir.load_tokenizer().context("reading tokenizer")? {
        Some(tokenizer) => {
            let caps = tokenizer.capabilities();
            println!(
                "Tokenizer:   {} pieces, scores: {}, merges: {}, pieces: {:?}",
                tokenizer.vocab.len(),
                caps.has_scores,
                caps.has_merges,
                caps.piece_encoding
            );
            if !tokenizer.special.is_empty() {
                println!("Special:     {}", tokenizer.special.tokens.join(" "));
            }
        }
        None => println!("Tokenizer:   none"),
    }
    Ok(())
}
