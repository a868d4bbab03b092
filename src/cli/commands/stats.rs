use anyhow::{bail, Result};
use colored::Colorize;

use crate::cli::format_number;
use crate::config::Config;
use crate::usage::aggregate::{self, SortKey};
use crate::usage::reader::cache_hit_rate;
use crate::usage::StatsReader;

/// Show the current stats cache: totals, per-model usage and recent days
pub async fn run(config: &Config, json: bool) -> Result<()> {
    let reader = StatsReader::new(config.claude_dir_path());
    let Some(snapshot) = reader.snapshot().await else {
        bail!(
            "Stats cache is not available at {}",
            reader.stats_cache_file().display()
        );
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let pricing = config.pricing_table()?;

    println!("\n{}", "  Token Usage".bold().bright_yellow());
    println!("{}", "  ─────────────────────────────".dimmed());

    println!(
        "\n  {} {} sessions, {} tokens, {:.1}% cache hits",
        "Overview:".bold(),
        snapshot.total_sessions.to_string().bright_yellow(),
        format_number(snapshot.total_tokens).bright_yellow(),
        cache_hit_rate(&snapshot.models) * 100.0
    );

    let models = aggregate::top_n(&snapshot.models, snapshot.models.len(), SortKey::TotalTokens);
    if !models.is_empty() {
        println!("\n  {}", "Models:".bold());
        for model in &models {
            println!(
                "  {:<36} {:>14} in {:>12} out {:>14} cache  {}",
                model.model,
                format_number(model.usage.input_tokens),
                format_number(model.usage.output_tokens),
                format_number(model.usage.cache_read_tokens + model.usage.cache_creation_tokens),
                format!("${:.2}", pricing.cost(&model.usage, &model.model)).green()
            );
        }
    }

    let mut recent = snapshot.daily_activities.clone();
    recent.sort_by(|a, b| b.date.cmp(&a.date));
    recent.truncate(7);
    if !recent.is_empty() {
        println!("\n  {}", "Recent Days:".bold());
        let max_tokens = recent.iter().map(|d| d.total_tokens).max().unwrap_or(0);
        for day in recent.iter().rev() {
            let bar_len = if max_tokens > 0 {
                (day.total_tokens * 30 / max_tokens) as usize
            } else {
                0
            };
            println!(
                "  {} {} {} {}",
                day.date.dimmed(),
                "\u{2588}".repeat(bar_len).bright_yellow(),
                format_number(day.total_tokens),
                format!("({} sessions)", day.session_count).dimmed()
            );
        }
    }

    println!();
    Ok(())
}
