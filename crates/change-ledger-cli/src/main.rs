use anyhow::Result;
use change_ledger_cli::{run_cli, Cli};
use clap::Parser;

fn main() -> Result<()> {
    run_cli(Cli::parse())
}
