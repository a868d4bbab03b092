use anyhow::Result;
use colored::Colorize;

use crate::cli::format_number;
use crate::config::Config;
use crate::usage::aggregate;
use crate::usage::{parse_date, StatsReader};

/// Daily totals with growth against the preceding window
pub async fn run(config: &Config, start: Option<&str>, end: Option<&str>, period: Option<usize>) -> Result<()> {
    for date in [start, end].into_iter().flatten() {
        parse_date(date)?;
    }
    let period = period.unwrap_or(config.analytics.trend_period_days).max(1);

    let reader = StatsReader::new(config.claude_dir_path());
    let days = reader.daily_activity(start, end).await;
    let trend = aggregate::trend(&days, period);
    let summary = aggregate::range_summary(&days, start, end);

    println!(
        "\n{}",
        format!("  Usage Trend ({}-day window)", period)
            .bold()
            .bright_yellow()
    );
    println!("{}", "  ─────────────────────────────".dimmed());

    if trend.is_empty() {
        println!("\n  No daily activity recorded.\n");
        return Ok(());
    }

    println!(
        "\n  {} {} days, {} sessions, {} tokens (avg {}/day)",
        "Summary:".bold(),
        summary.total_days.to_string().bright_yellow(),
        summary.total_sessions.to_string().bright_yellow(),
        format_number(summary.total_tokens).bright_yellow(),
        format_number(summary.avg_daily_tokens.round() as u64)
    );

    println!();
    for (date, point) in &trend {
        let growth = format!("{:+.1}%", point.growth_rate);
        let growth = if point.growth_rate > 0.0 {
            growth.red()
        } else if point.growth_rate < 0.0 {
            growth.green()
        } else {
            growth.dimmed()
        };
        println!(
            "  {} {:>14} {}",
            date.dimmed(),
            format_number(point.total_tokens),
            growth
        );
    }

    println!();
    Ok(())
}
