/// Module for the `budget` subcommand, which streams a dex dump and reports
/// how many methods the matching smali directory may still receive.
use clap::Args;
use dexcloak_core::dexdump;
use serde_json::json;
use std::error::Error;
use std::path::PathBuf;

/// Arguments for the `budget` subcommand.
#[derive(Args)]
pub struct BudgetArgs {
    /// Disassembly dump of one compiled dex unit.
    pub dump: PathBuf,
}

impl super::Command for BudgetArgs {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        let methods = dexdump::count_methods_in_dump(&self.dump)?;
        let budget = dexdump::DEX_METHOD_CEILING.saturating_sub(methods);
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "dump": self.dump,
                "methods": methods,
                "ceiling": dexdump::DEX_METHOD_CEILING,
                "budget": budget,
            }))?
        );
        Ok(())
    }
}
