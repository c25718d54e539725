// ============================================================================
// REPORT SINKS
// ============================================================================
// The push side of the agent. A sink receives finalized reports on the
// report schedule and hands their flattened points to whatever sits
// downstream. A failing sink never stops the scheduler.
// ============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{ExportConfig, SinkKind};
use crate::error::{ExportError, ExportResult};
use crate::model::MetricsReport;

// ----------------------------------------------------------------------------
// 16.1 Sink Trait
// ----------------------------------------------------------------------------

/// Destination for finalized reports.
#[async_trait]
pub trait ReportSink: Send + Sync {
    fn name(&self) -> &str;

    async fn push(&self, report: &MetricsReport) -> ExportResult<()>;

    /// Flush anything buffered. Called on shutdown.
    async fn flush(&self) -> ExportResult<()> {
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 16.2 Log Sink
// ----------------------------------------------------------------------------

/// Summarizes each report as a tracing event; points go out at debug.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl ReportSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn push(&self, report: &MetricsReport) -> ExportResult<()> {
        info!(
            target: "nginx_telemetry::export",
            entities = report.entities.len(),
            metrics = report.metric_count(),
            timestamp = %report.timestamp,
            "Report ready"
        );
        for point in report.to_points() {
            debug!(
                target: "nginx_telemetry::export",
                name = %point.name,
                value = point.value,
                dimensions = point.dimensions.len(),
                "point"
            );
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 16.3 JSON Lines Sink
// ----------------------------------------------------------------------------

/// Appends one JSON object per metric point to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_failed(&self, e: impl ToString) -> ExportError {
        ExportError::WriteFailed {
            target: self.path.display().to_string(),
            message: e.to_string(),
        }
    }
}

#[async_trait]
impl ReportSink for JsonLinesSink {
    fn name(&self) -> &str {
        "json"
    }

    async fn push(&self, report: &MetricsReport) -> ExportResult<()> {
        let mut buf = Vec::new();
        for point in report.to_points() {
            serde_json::to_writer(&mut buf, &point)?;
            buf.push(b'\n');
        }
        if buf.is_empty() {
            return Ok(());
        }

        let mut file = self.file.lock().await;
        if file.is_none() {
            let opened = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.write_failed(e))?;
            *file = Some(opened);
        }

        if let Some(handle) = file.as_mut() {
            if let Err(e) = handle.write_all(&buf).await {
                // reopen on the next push
                *file = None;
                return Err(self.write_failed(e));
            }
        }
        Ok(())
    }

    async fn flush(&self) -> ExportResult<()> {
        if let Some(handle) = self.file.lock().await.as_mut() {
            handle.flush().await.map_err(|e| self.write_failed(e))?;
        }
        Ok(())
    }
}

/// Build the configured sink.
pub fn sink_from_config(config: &ExportConfig) -> ExportResult<Arc<dyn ReportSink>> {
    match config.sink {
        SinkKind::Log => Ok(Arc::new(LogSink)),
        SinkKind::Json => match &config.path {
            Some(path) => Ok(Arc::new(JsonLinesSink::new(path))),
            None => Err(ExportError::WriteFailed {
                target: "json".into(),
                message: "export.path is required for the json sink".into(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dimension, MetricPoint, SimpleMetric, StatsEntity};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn report() -> MetricsReport {
        MetricsReport::new(vec![StatsEntity::new(
            vec![Dimension::new("hostname", "web-01")],
            vec![
                SimpleMetric::new("nginx.status", 1.0),
                SimpleMetric::new("nginx.http.request.count", 42.0),
            ],
        )])
    }

    #[tokio::test]
    async fn test_json_sink_appends_points() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("points.jsonl");
        let sink = JsonLinesSink::new(&path);

        sink.push(&report()).await.unwrap();
        sink.push(&report()).await.unwrap();
        sink.flush().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let points: Vec<MetricPoint> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(points.len(), 4);
        assert_eq!(points[1].name, "nginx.http.request.count");
        assert_eq!(points[1].value, 42.0);
        assert_eq!(points[1].dimensions, vec![Dimension::new("hostname", "web-01")]);
    }

    #[tokio::test]
    async fn test_json_sink_skips_empty_report() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("points.jsonl");
        let sink = JsonLinesSink::new(&path);

        sink.push(&MetricsReport::empty()).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_json_sink_reports_unwritable_path() {
        let dir = TempDir::new().unwrap();
        let sink = JsonLinesSink::new(dir.path().join("missing").join("points.jsonl"));
        let err = sink.push(&report()).await.unwrap_err();
        assert!(matches!(err, ExportError::WriteFailed { .. }));
    }

    #[test]
    fn test_sink_from_config() {
        let log = sink_from_config(&ExportConfig::default()).unwrap();
        assert_eq!(log.name(), "log");

        let json = ExportConfig {
            sink: SinkKind::Json,
            path: None,
        };
        assert!(sink_from_config(&json).is_err());
    }
}
