//! Metrics and log bundle retrieval

use anyhow::{Context, Result};
use colored::Colorize;
use glidein_lib::{
    finalizer::safe_extract,
    metrics::{check_series, SeriesResponse},
};
use std::path::{Path, PathBuf};
use tabled::Tabled;
use url::Url;

use crate::client::ApiClient;
use crate::output::{format_timestamp, print_items, print_success, print_warning, OutputFormat};

#[derive(Tabled)]
struct SeriesRow {
    #[tabled(rename = "Series")]
    target: String,
    #[tabled(rename = "Points")]
    points: usize,
    #[tabled(rename = "Latest")]
    latest: String,
    #[tabled(rename = "At")]
    at: String,
}

impl From<&SeriesResponse> for SeriesRow {
    fn from(series: &SeriesResponse) -> Self {
        let last = series.datapoints.last();
        Self {
            target: series.target.clone(),
            points: series.datapoints.len(),
            latest: last
                .map(|(value, _)| format!("{value:.2}"))
                .unwrap_or_else(|| "-".to_string()),
            at: last
                .map(|(_, ts)| format_timestamp(*ts))
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Render `target` and warn about series with no data or only zeros.
/// Returns the number of series that failed the check.
pub async fn metrics(
    client: &ApiClient,
    target: &str,
    from: &str,
    format: OutputFormat,
) -> Result<usize> {
    let series = client.render(target, from).await?;
    print_items(&series, format, |s| SeriesRow::from(s))?;

    let mut flagged = 0;
    if series.is_empty() {
        print_warning(&format!("No series match {target}"));
        flagged += 1;
    }
    for entry in &series {
        if let Err(e) = check_series(entry) {
            print_warning(&e.to_string());
            flagged += 1;
        }
    }
    Ok(flagged)
}

/// Fetch a log bundle from its presigned URL and extract it under `dest`.
/// Nothing is written if any entry would escape `dest`.
pub async fn fetch_logs(
    client: &ApiClient,
    url: &str,
    dest: &Path,
    format: OutputFormat,
) -> Result<Vec<PathBuf>> {
    let url = Url::parse(url).with_context(|| format!("Invalid log URL {url}"))?;
    let bytes = client.download(&url).await?;

    let target = dest.to_path_buf();
    let extracted = tokio::task::spawn_blocking(move || safe_extract(&bytes, &target))
        .await
        .context("Extraction task failed")??;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&extracted)?),
        OutputFormat::Table => {
            print_success(&format!(
                "Extracted {} file(s) into {}",
                extracted.len(),
                dest.display().to_string().cyan()
            ));
            for path in &extracted {
                println!("  {}", path.display());
            }
        }
    }
    Ok(extracted)
}
