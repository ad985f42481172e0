//! Time-series backends for aggregated metrics
//!
//! Pushes use the Graphite plaintext protocol. The in-memory store keeps
//! recent points and answers Graphite-style `render` queries for observers.

use crate::error::GlideinError;
use crate::models::AggregatedMetric;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Push interface of a time-series store
#[async_trait]
pub trait TimeSeriesBackend: Send + Sync {
    async fn push(&self, points: &[AggregatedMetric]) -> Result<()>;
}

/// Graphite carbon plaintext receiver (`name value timestamp\n`)
#[derive(Debug, Clone)]
pub struct GraphiteBackend {
    address: String,
    timeout: Duration,
}

impl GraphiteBackend {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    fn encode(points: &[AggregatedMetric]) -> String {
        points
            .iter()
            .map(|p| format!("{} {} {}\n", p.series, p.value, p.timestamp))
            .collect()
    }
}

#[async_trait]
impl TimeSeriesBackend for GraphiteBackend {
    async fn push(&self, points: &[AggregatedMetric]) -> Result<()> {
        let payload = Self::encode(points);
        let send = async {
            let mut stream = TcpStream::connect(&self.address)
                .await
                .with_context(|| format!("Failed to connect to graphite at {}", self.address))?;
            stream.write_all(payload.as_bytes()).await?;
            stream.shutdown().await?;
            Ok::<_, anyhow::Error>(())
        };
        tokio::time::timeout(self.timeout, send)
            .await
            .with_context(|| format!("Graphite push to {} timed out", self.address))??;
        debug!(points = points.len(), address = %self.address, "Pushed metrics to graphite");
        Ok(())
    }
}

/// Pushes to every backend; fails if any push fails
#[derive(Clone, Default)]
pub struct FanoutBackend {
    backends: Vec<Arc<dyn TimeSeriesBackend>>,
}

impl FanoutBackend {
    pub fn new(backends: Vec<Arc<dyn TimeSeriesBackend>>) -> Self {
        Self { backends }
    }
}

#[async_trait]
impl TimeSeriesBackend for FanoutBackend {
    async fn push(&self, points: &[AggregatedMetric]) -> Result<()> {
        let mut first_error = None;
        for backend in &self.backends {
            if let Err(e) = backend.push(points).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesTags {
    pub name: String,
}

/// One rendered series, shaped like Graphite's JSON render output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesResponse {
    pub target: String,
    pub tags: SeriesTags,
    /// `[value, timestamp]` pairs
    pub datapoints: Vec<(f64, i64)>,
}

/// Observer-side data quality check of one rendered series
pub fn check_series(series: &SeriesResponse) -> std::result::Result<(), GlideinError> {
    if series.datapoints.is_empty() {
        return Err(GlideinError::NoDatapoints {
            series: series.target.clone(),
        });
    }
    if series.datapoints.iter().all(|(value, _)| *value == 0.0) {
        return Err(GlideinError::AllZeroMetric {
            series: series.target.clone(),
        });
    }
    Ok(())
}

/// Parse a Graphite relative time such as `-5min`, `-2h`, `-30s`, `-1d`
pub fn parse_from(from: &str, now: i64) -> Option<i64> {
    let spec = from.strip_prefix('-')?;
    let split = spec.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = spec.split_at(split);
    let amount: i64 = amount.parse().ok()?;
    let seconds = match unit {
        "s" | "sec" | "secs" | "seconds" => 1,
        "min" | "mins" | "minutes" => 60,
        "h" | "hour" | "hours" => 3600,
        "d" | "day" | "days" => 86_400,
        _ => return None,
    };
    amount
        .checked_mul(seconds)
        .and_then(|offset| now.checked_sub(offset))
}

fn target_matches(pattern: &str, series: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let series: Vec<&str> = series.split('.').collect();
    pattern.len() == series.len()
        && pattern
            .iter()
            .zip(&series)
            .all(|(p, s)| *p == "*" || p == s)
}

/// Bounded in-process store of pushed points. Series whose points have all
/// aged out of retention are dropped.
#[derive(Debug)]
pub struct InMemoryTimeSeries {
    series: RwLock<BTreeMap<String, Vec<(f64, i64)>>>,
    retention: Duration,
}

impl InMemoryTimeSeries {
    pub fn new(retention: Duration) -> Self {
        Self {
            series: RwLock::new(BTreeMap::new()),
            retention,
        }
    }

    /// Series matching `target` (dot-separated, `*` matches one segment)
    /// with datapoints at or after `from`
    pub fn render(&self, target: &str, from: i64) -> Vec<SeriesResponse> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series
            .iter()
            .filter(|(name, _)| target_matches(target, name))
            .map(|(name, points)| SeriesResponse {
                target: name.clone(),
                tags: SeriesTags { name: name.clone() },
                datapoints: points.iter().copied().filter(|(_, ts)| *ts >= from).collect(),
            })
            .collect()
    }

    pub fn series_names(&self) -> Vec<String> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series.keys().cloned().collect()
    }
}

impl Default for InMemoryTimeSeries {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

#[async_trait]
impl TimeSeriesBackend for InMemoryTimeSeries {
    async fn push(&self, points: &[AggregatedMetric]) -> Result<()> {
        let Some(newest) = points.iter().map(|p| p.timestamp).max() else {
            return Ok(());
        };
        let cutoff = newest.saturating_sub(self.retention.as_secs() as i64);

        let mut series = self.series.write().unwrap_or_else(|e| e.into_inner());
        for point in points {
            series
                .entry(point.series.clone())
                .or_default()
                .push((point.value, point.timestamp));
        }
        series.retain(|_, datapoints| {
            datapoints.retain(|(_, ts)| *ts >= cutoff);
            !datapoints.is_empty()
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn point(series: &str, value: f64, ts: i64) -> AggregatedMetric {
        AggregatedMetric {
            series: series.to_string(),
            timestamp: ts,
            value,
        }
    }

    #[test]
    fn test_parse_from() {
        assert_eq!(parse_from("-5min", 1000), Some(700));
        assert_eq!(parse_from("-2h", 10_000), Some(2800));
        assert_eq!(parse_from("-30s", 100), Some(70));
        assert_eq!(parse_from("5min", 1000), None);
        assert_eq!(parse_from("-5weeks", 1000), None);
    }

    #[test]
    fn test_parse_from_rejects_overflowing_offset() {
        assert_eq!(parse_from("-9223372036854775807min", 1000), None);
        assert_eq!(parse_from("-9223372036854775807s", i64::MIN + 10), None);
        assert_eq!(parse_from("-99999999999999999999s", 1000), None);
    }

    #[tokio::test]
    async fn test_aged_out_series_are_dropped() {
        let store = InMemoryTimeSeries::new(Duration::from_secs(600));
        store
            .push(&[
                point("ns.SiteA-1.Cluster.TIME_PER_PHOTON", 2.0, 1000),
                point("ns.c.Cluster.glideins.idle", 1.0, 1000),
            ])
            .await
            .unwrap();
        store
            .push(&[point("ns.c.Cluster.glideins.idle", 0.0, 2000)])
            .await
            .unwrap();

        assert_eq!(store.series_names(), vec!["ns.c.Cluster.glideins.idle".to_string()]);
        let idle = store.render("ns.c.Cluster.glideins.idle", 0);
        assert_eq!(idle[0].datapoints, vec![(0.0, 2000)]);
    }

    #[test]
    fn test_check_series_flags_all_zero() {
        let mut series = SeriesResponse {
            target: "ns.c.Cluster.glideins.idle".to_string(),
            tags: SeriesTags {
                name: "ns.c.Cluster.glideins.idle".to_string(),
            },
            datapoints: vec![],
        };
        assert!(matches!(check_series(&series), Err(GlideinError::NoDatapoints { .. })));

        series.datapoints = vec![(0.0, 1), (0.0, 2)];
        assert!(matches!(check_series(&series), Err(GlideinError::AllZeroMetric { .. })));

        series.datapoints.push((1.0, 3));
        assert!(check_series(&series).is_ok());
    }

    #[tokio::test]
    async fn test_in_memory_render_filters_by_target_and_time() {
        let store = InMemoryTimeSeries::default();
        store
            .push(&[
                point("ns.c.Cluster.glideins.idle", 0.0, 100),
                point("ns.c.Cluster.glideins.idle", 2.0, 400),
                point("ns.c.Cluster.glideins.running", 1.0, 400),
                point("ns.c.Other.glideins.idle", 5.0, 400),
            ])
            .await
            .unwrap();

        let rendered = store.render("ns.c.Cluster.glideins.idle", 300);
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0].tags.name, "ns.c.Cluster.glideins.idle");
        assert_eq!(rendered[0].datapoints, vec![(2.0, 400)]);

        let wildcard = store.render("ns.c.*.glideins.idle", 0);
        assert_eq!(wildcard.len(), 2);
    }

    #[tokio::test]
    async fn test_graphite_backend_writes_plaintext() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = String::new();
            socket.read_to_string(&mut received).await.unwrap();
            received
        });

        let backend = GraphiteBackend::new(addr.to_string(), Duration::from_secs(5));
        backend
            .push(&[point("ns.c.Cluster.glideins.launched", 3.0, 1700000000)])
            .await
            .unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, "ns.c.Cluster.glideins.launched 3 1700000000\n");
    }

    #[tokio::test]
    async fn test_graphite_backend_reports_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let backend = GraphiteBackend::new(addr.to_string(), Duration::from_secs(1));
        assert!(backend.push(&[point("a.b.c.d", 1.0, 1)]).await.is_err());
    }
}
