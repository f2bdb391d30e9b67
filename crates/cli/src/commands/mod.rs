use clap::Subcommand;
use std::error::Error;

pub mod budget;
pub mod obfuscate;

#[derive(Subcommand)]
pub enum Cmd {
    /// Apply obfuscation passes to a package tree, rewriting files in place
    Obfuscate(obfuscate::ObfuscateArgs),

    /// Count the methods in a dex dump and print the remaining budget
    Budget(budget::BudgetArgs),
}

pub trait Command {
    fn execute(self) -> Result<(), Box<dyn Error>>;
}

impl Command for Cmd {
    fn execute(self) -> Result<(), Box<dyn Error>> {
        match self {
            Self::Obfuscate(args) => args.execute(),
            Self::Budget(args) => args.execute(),
        }
    }
}
