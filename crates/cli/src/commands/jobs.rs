//! Job submission and queue commands

use anyhow::Result;
use colored::Colorize;
use glidein_lib::{
    models::{ClusterId, JobSpec},
    queue::{HistoryEntry, JobFilter},
};
use tabled::Tabled;

use crate::client::{ApiClient, RemoveResponse, SubmitResponse};
use crate::output::{color_status, format_timestamp, print_items, print_success, OutputFormat};

#[derive(Tabled)]
struct HistoryRow {
    #[tabled(rename = "Job")]
    id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Exit")]
    exit_code: String,
    #[tabled(rename = "Worker")]
    worker: String,
    #[tabled(rename = "Finished")]
    completed_at: String,
}

impl From<&HistoryEntry> for HistoryRow {
    fn from(entry: &HistoryEntry) -> Self {
        let status = serde_json::to_value(entry.status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            id: entry.id.to_string(),
            status: color_status(&status),
            exit_code: entry
                .exit_code
                .map(|code| code.to_string())
                .unwrap_or_else(|| "-".to_string()),
            worker: entry.worker.clone().unwrap_or_else(|| "-".to_string()),
            completed_at: format_timestamp(entry.completed_at),
        }
    }
}

pub async fn submit(
    client: &ApiClient,
    spec: JobSpec,
    count: u32,
    format: OutputFormat,
) -> Result<SubmitResponse> {
    let response = client.submit(spec, count).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Table => print_success(&format!(
            "{} job(s) submitted to cluster {}",
            response.count,
            response.cluster.to_string().cyan()
        )),
    }
    Ok(response)
}

pub async fn history(
    client: &ApiClient,
    cluster: Option<u64>,
    limit: usize,
    format: OutputFormat,
) -> Result<Vec<HistoryEntry>> {
    let entries = client.history(cluster.map(ClusterId), limit).await?;
    print_items(&entries, format, |e| HistoryRow::from(e))?;
    Ok(entries)
}

/// Remove one cluster, or every job when `cluster` is `None`
pub async fn remove(
    client: &ApiClient,
    cluster: Option<u64>,
    format: OutputFormat,
) -> Result<RemoveResponse> {
    let filter = match cluster {
        Some(cluster) => JobFilter::cluster(ClusterId(cluster)),
        None => JobFilter::all(),
    };
    let response = client.remove(&filter).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&response)?),
        OutputFormat::Table => print_success(&format!("{} job(s) removed", response.removed)),
    }
    Ok(response)
}
