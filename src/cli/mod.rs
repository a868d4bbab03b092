pub mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::{load_config, load_config_from, Config};
use crate::logging;

#[derive(Parser)]
#[command(name = "tokmon", about = "Local token usage dashboard backend", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file to use instead of the default location
    #[arg(short, long, global = true, env = "TOKEN_MONITOR_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP/WebSocket server with live updates and periodic snapshots
    Serve {
        /// Bind host, overrides server.host
        #[arg(long)]
        host: Option<String>,

        /// Bind port, overrides server.port
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Show current usage from the stats cache
    Stats {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Estimate cost per model and per day
    Cost {
        /// First day to include (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// Last day to include (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        #[arg(long)]
        json: bool,
    },
    /// Daily token trend against the preceding period
    Trends {
        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,

        /// Days in the comparison window, overrides analytics.trend_period_days
        #[arg(short, long)]
        period: Option<usize>,
    },
    /// Capture the stats cache into the snapshot database
    Snapshot,
    /// List stored snapshots, newest first
    History {
        #[arg(long)]
        start: Option<String>,

        #[arg(long)]
        end: Option<String>,

        /// Number of snapshots to list (1-1000)
        #[arg(short, long, default_value_t = 20, value_parser = clap::value_parser!(u16).range(1..=1000))]
        limit: u16,
    },
    /// Delete snapshots older than the retention period
    Cleanup {
        /// Retention in days, overrides snapshots.retention_days
        #[arg(short, long)]
        days: Option<u32>,
    },
    /// Show the config file location and effective values
    Config {
        /// Write the effective config back to the file
        #[arg(long)]
        save: bool,
    },
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        match &self.config {
            Some(path) => load_config_from(path),
            None => load_config(),
        }
    }
}

/// Load config, install logging and run the selected command
pub async fn run(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;
    logging::init(&config.logging.level);

    match cli.command {
        Commands::Serve { host, port } => commands::serve::run(config, host, port).await,
        Commands::Stats { json } => commands::stats::run(&config, json).await,
        Commands::Cost { start, end, json } => {
            commands::cost::run(&config, start.as_deref(), end.as_deref(), json).await
        }
        Commands::Trends { start, end, period } => {
            commands::trends::run(&config, start.as_deref(), end.as_deref(), period).await
        }
        Commands::Snapshot => commands::snapshot::run_capture(&config).await,
        Commands::History { start, end, limit } => {
            commands::snapshot::run_history(&config, start, end, usize::from(limit)).await
        }
        Commands::Cleanup { days } => commands::snapshot::run_cleanup(&config, days).await,
        Commands::Config { save } => commands::config::run(&config, cli.config.as_deref(), save),
    }
}

/// `1234567` -> `1,234,567`
pub(crate) fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
