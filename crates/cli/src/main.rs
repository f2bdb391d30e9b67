/// Entry point for the Dexcloak CLI, a smali assembly obfuscation tool.
///
/// This module parses command-line arguments and dispatches to subcommands
/// for applying obfuscation passes or inspecting a dex dump's method budget.
/// It initializes logging and handles the main execution flow.
use clap::Parser;
use dexcloak_cli::commands::{Cmd, Command};
use tracing_subscriber::EnvFilter;

/// Command-line interface for Dexcloak.
///
/// Dexcloak rewrites decompiled Android assembly in place, applying
/// behavior-preserving obfuscation passes (call indirection, reflection,
/// junk insertion, string encryption, renaming, …) under the dex method
/// ceiling.
#[derive(Parser)]
#[command(name = "dexcloak")]
#[command(about = "Dexcloak: smali assembly obfuscator")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

/// Runs the Dexcloak CLI with the provided arguments.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    cli.command.execute()
}
