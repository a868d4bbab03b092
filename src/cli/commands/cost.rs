use anyhow::Result;
use colored::Colorize;
use serde_json::json;

use crate::cli::format_number;
use crate::config::Config;
use crate::usage::{parse_date, StatsReader};

/// Estimated spend per model, plus per day where the split is known
pub async fn run(config: &Config, start: Option<&str>, end: Option<&str>, json: bool) -> Result<()> {
    for date in [start, end].into_iter().flatten() {
        parse_date(date)?;
    }

    let reader = StatsReader::new(config.claude_dir_path());
    let pricing = config.pricing_table()?;

    let models = reader.model_usage().await;
    let summary = pricing.summarize(&models);
    let days = reader.daily_activity(None, None).await;
    let daily = pricing.daily_cost(&days, start, end);

    if json {
        let output = json!({ "summary": summary, "daily": daily });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("\n{}", "  Estimated Cost".bold().bright_yellow());
    println!("{}", "  ─────────────────────────────".dimmed());

    println!(
        "\n  {} {} over {} tokens ({} per 1M)",
        "Total:".bold(),
        format!("${:.2}", summary.total_cost_usd).bright_yellow(),
        format_number(summary.total_tokens),
        format!("${:.2}", summary.avg_cost_per_million_tokens)
    );

    if !summary.model_costs.is_empty() {
        println!("\n  {}", "By Model:".bold());
        let mut costs: Vec<(&String, &f64)> = summary.model_costs.iter().collect();
        costs.sort_by(|a, b| b.1.total_cmp(a.1));
        for (model, cost) in costs {
            let share = summary.model_percentages.get(model).copied().unwrap_or(0.0);
            println!(
                "  {:<36} {:>10} {}",
                model,
                format!("${:.2}", cost).green(),
                format!("{:.1}%", share).dimmed()
            );
        }
    }

    if !daily.is_empty() {
        println!("\n  {}", "By Day:".bold());
        for (date, cost) in &daily {
            println!("  {} {}", date.dimmed(), format!("${:.2}", cost));
        }
    }

    println!();
    Ok(())
}
