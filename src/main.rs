use anyhow::Result;
use clap::Parser;

use token_monitor::cli::{self, Cli};

#[tokio::main]
async fn main() -> Result<()> {
    cli::run(Cli::parse()).await
}
