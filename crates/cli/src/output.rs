//! Output formatting utilities

use chrono::{TimeZone, Utc};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeMap;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows as a table, or the raw items as JSON
pub fn print_items<T: Serialize, R: Tabled>(
    items: &[T],
    format: OutputFormat,
    row: impl Fn(&T) -> R,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(items)?),
        OutputFormat::Table => {
            if items.is_empty() {
                print_warning("No items found");
                return Ok(());
            }
            let rows: Vec<R> = items.iter().map(row).collect();
            println!("{}", Table::new(rows).with(Style::rounded()));
            println!("\nTotal: {}", items.len());
        }
    }
    Ok(())
}

pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Names of the capabilities advertised as true
pub fn format_resources(resources: &BTreeMap<String, bool>) -> String {
    let present: Vec<&str> = resources
        .iter()
        .filter(|(_, value)| **value)
        .map(|(name, _)| name.as_str())
        .collect();
    if present.is_empty() {
        "-".to_string()
    } else {
        present.join(",")
    }
}

pub fn format_timestamp(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// Color job statuses and glidein activities
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "idle" => status.yellow().to_string(),
        "running" | "busy" => status.blue().to_string(),
        "completed" => status.green().to_string(),
        "draining" | "removed" => status.magenta().to_string(),
        "failed" => status.red().to_string(),
        _ => status.to_string(),
    }
}
