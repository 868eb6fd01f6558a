//! Convert command: run a model directory through the reference runtime

use crate::utils::format_bytes;
use anyhow::{Context, Result};
use clap::Args;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use weightline_bridge::{ConvertOptions, Converter, MemoryRuntime};
use weightline_core::{HfModelDir, Precision};

#[derive(Args)]
pub struct ConvertCommand {
    /// Hugging Face model directory
    pub model_dir: PathBuf,

    /// Precision for linear layers (int4, int8, float16, float32)
    #[arg(long)]
    pub dtype: Option<Precision>,

    /// Text put in front of every conversation
    #[arg(long)]
    pub pre_prompt: Option<String>,

    /// Prefix of user turns
    #[arg(long)]
    pub user_role: Option<String>,

    /// Prefix of model turns
    #[arg(long)]
    pub bot_role: Option<String>,

    /// Separator between conversation rounds
    #[arg(long)]
    pub history_sep: Option<String>,

    /// Family profile to use instead of the detected one
    #[arg(long)]
    pub family: Option<String>,

    /// JSON file with conversion options; flags take precedence
    #[arg(long)]
    pub options: Option<PathBuf>,

    /// Write the assembled model manifest as JSON ("-" for stdout)
    #[arg(long)]
    pub manifest: Option<PathBuf>,
}

impl ConvertCommand {
    fn resolve_options(&self) -> Result<ConvertOptions> {
        let mut options = match &self.options {
            Some(path) => load_options(path)?,
            None => ConvertOptions::default(),
        };
        if let Some(dtype) = self.dtype {
            options.dtype = dtype;
        }
        let templates = &mut options.templates;
        for (flag, slot) in [
            (&self.pre_prompt, &mut templates.pre_prompt),
            (&self.user_role, &mut templates.user_role),
            (&self.bot_role, &mut templates.bot_role),
            (&self.history_sep, &mut templates.history_sep),
        ] {
            if flag.is_some() {
                slot.clone_from(flag);
            }
        }
        if self.family.is_some() {
            options.family.clone_from(&self.family);
        }
        Ok(options)
    }
}

fn load_options(path: &Path) -> Result<ConvertOptions> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading options file {}", path.display()))?;
    let options = serde_json::from_str(&text)
        .map_err(weightline_core::Error::from)
        .with_context(|| format!("parsing options file {}", path.display()))?;
    Ok(options)
}

pub fn execute(cmd: ConvertCommand) -> Result<()> {
    let options = cmd.resolve_options()?;
    tracing::debug!(?options, "resolved conversion options");

    let dir = HfModelDir::open(&cmd.model_dir)
        .with_context(|| format!("opening model directory {}", cmd.model_dir.display()))?;
    let mut model = dir.load_model().context("reading model weights")?;
    let tokenizer = dir.load_tokenizer().context("reading tokenizer")?;
    if tokenizer.is_none() {
        tracing::warn!("no tokenizer.json found, converting without a vocabulary");
    }

    let mut runtime = MemoryRuntime::without_payloads();
    let report = Converter::new(options)
        .convert(&mut runtime, &mut model, tokenizer)
        .with_context(|| format!("converting {}", cmd.model_dir.display()))?;

    println!("Model:          {} (family {})", report.model_type, report.family);
    println!("Config entries: {}", report.config_entries);
    println!("Vocabulary:     {} pieces, {} special tokens", report.vocab_entries, report.special_tokens);
    println!("Weights:        {} ({})", report.weights, format_bytes(report.payload_bytes));

    if let Some(path) = &cmd.manifest {
        let manifest = runtime.manifest(report.handle)?;
        if path.as_os_str() == "-" {
            serde_json::to_writer_pretty(io::stdout().lock(), &manifest)?;
            println!();
        } else {
            let file = File::create(path)
                .with_context(|| format!("creating manifest {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, &manifest)?;
            writer.flush()?;
            tracing::info!("wrote manifest to {}", path.display());
        }
    }
    Ok(())
}
