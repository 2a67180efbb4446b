use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = profile_store_cli::Cli::parse();
    profile_store_cli::run_cli(cli)
}
