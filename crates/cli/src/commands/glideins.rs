//! Registry queries

use anyhow::{bail, Result};
use glidein_lib::{models::GlideinRecord, registry::RetryPolicy};
use tabled::Tabled;

use crate::client::{ApiClient, GlideinQuery};
use crate::output::{color_status, format_resources, print_info, print_items, OutputFormat};

#[derive(Tabled)]
struct GlideinRow {
    #[tabled(rename = "Identity")]
    identity: String,
    #[tabled(rename = "Site")]
    site: String,
    #[tabled(rename = "Partition")]
    partition: String,
    #[tabled(rename = "Activity")]
    activity: String,
    #[tabled(rename = "Resources")]
    resources: String,
    #[tabled(rename = "Warnings")]
    warnings: usize,
    #[tabled(rename = "Log")]
    log: String,
}

impl From<&GlideinRecord> for GlideinRow {
    fn from(record: &GlideinRecord) -> Self {
        let activity = serde_json::to_value(record.activity)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        Self {
            identity: record.identity.clone(),
            site: record.site.clone(),
            partition: record.partition.clone(),
            activity: color_status(&activity),
            resources: format_resources(&record.resources),
            warnings: record.warnings.len(),
            log: if record.log_url.is_some() { "yes" } else { "-" }.to_string(),
        }
    }
}

pub async fn list(
    client: &ApiClient,
    query: &GlideinQuery,
    format: OutputFormat,
) -> Result<Vec<GlideinRecord>> {
    let records = client.glideins(query).await?;
    print_items(&records, format, |r| GlideinRow::from(r))?;
    Ok(records)
}

/// Poll the registry with backoff until a record matches
pub async fn wait(
    client: &ApiClient,
    query: &GlideinQuery,
    policy: &RetryPolicy,
    format: OutputFormat,
) -> Result<Vec<GlideinRecord>> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        tokio::time::sleep(policy.backoff(attempt)).await;
        match client.glideins(query).await {
            Ok(records) if !records.is_empty() => {
                print_items(&records, format, |r| GlideinRow::from(r))?;
                return Ok(records);
            }
            Ok(_) => print_info(&format!("attempt {attempt}/{attempts}: no glideins yet")),
            Err(e) => print_info(&format!("attempt {attempt}/{attempts}: {e}")),
        }
    }
    bail!("no matching glideins after {attempts} attempts")
}
