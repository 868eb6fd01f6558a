//! weightline - convert Hugging Face checkpoints for a native inference runtime

mod commands;
mod utils;

use clap::{Parser, Subcommand};
use commands::{ConvertCommand, InspectCommand};
use std::process;
use utils::{exit_code, setup_logging};

#[derive(Parser)]
#[command(name = "weightline")]
#[command(about = "Serialize model weights, tokenizer and config for a native runtime")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet mode (only errors)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert a model directory and report what the runtime received
    Convert(ConvertCommand),

    /// Describe a model directory without converting it
    Inspect(InspectCommand),
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(cli.verbose, cli.quiet) {
        eprintln!("Error: failed to set up logging: {}", e);
        process::exit(1);
    }

    let result = match cli.command {
        Commands::Convert(cmd) => commands::convert::execute(cmd),
        Commands::Inspect(cmd) => commands::inspect::execute(cmd),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(exit_code(&e));
    }
}
