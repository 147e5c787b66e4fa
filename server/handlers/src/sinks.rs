use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use fp_relay::{OutboundRecord, Sink, SinkBuilder};
use serde_json::json;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::{Config, SinkKind};

/// Logs every record instead of writing it anywhere.
pub struct LogSink;

#[async_trait]
impl Sink for LogSink {
    async fn put(&self, target: &str, record: &OutboundRecord) -> Result<()> {
        info!(target_id = %target, record = %record.to_json(), "put record");
        Ok(())
    }
}

/// Appends `{"target", "record"}` lines to a local file.
pub struct JsonlFileSink {
    file: Mutex<File>,
}

impl JsonlFileSink {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("open sink file {}", path.display()))?;
        Ok(Self { file: Mutex::new(file) })
    }
}

#[async_trait]
impl Sink for JsonlFileSink {
    async fn put(&self, target: &str, record: &OutboundRecord) -> Result<()> {
        let mut line = json!({ "target": target, "record": record.to_json() }).to_string();
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await.context("write record")?;
        file.flush().await.context("flush record")?;
        Ok(())
    }
}

/// Builds the configured sink on first use.
pub struct SinkFactory {
    kind: SinkKind,
    path: Option<PathBuf>,
}

impl SinkFactory {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        if cfg.sink == SinkKind::Jsonl && cfg.sink_path.is_none() {
            bail!("--sink-path is required for the jsonl sink");
        }
        Ok(Self { kind: cfg.sink, path: cfg.sink_path.clone() })
    }
}

#[async_trait]
impl SinkBuilder for SinkFactory {
    async fn build(&self) -> Result<Arc<dyn Sink>> {
        info!(kind = ?self.kind, "building sink client");
        match (self.kind, &self.path) {
            (SinkKind::Log, _) => Ok(Arc::new(LogSink)),
            (SinkKind::Jsonl, Some(path)) => Ok(Arc::new(JsonlFileSink::open(path).await?)),
            (SinkKind::Jsonl, None) => bail!("no sink path configured"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn record(msg_id: &str) -> OutboundRecord {
        let mut fields = BTreeMap::new();
        fields.insert("msg_id".to_string(), msg_id.to_string());
        OutboundRecord { target: "coupons".into(), fields }
    }

    #[tokio::test]
    async fn test_jsonl_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let sink = JsonlFileSink::open(&path).await.unwrap();
        sink.put("coupons", &record("m1")).await.unwrap();
        sink.put("coupons", &record("m2")).await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["target"], "coupons");
        assert_eq!(lines[1]["record"]["msg_id"], "m2");
    }

    #[tokio::test]
    async fn test_factory_builds_configured_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        let factory = SinkFactory { kind: SinkKind::Jsonl, path: Some(path.clone()) };
        let sink = factory.build().await.unwrap();
        sink.put("t", &record("m1")).await.unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_jsonl_requires_path() {
        use clap::Parser;
        let cfg = Config::try_parse_from(["fp-handlers", "--handler", "stream-to-broker", "--sink", "jsonl"]).unwrap();
        assert!(SinkFactory::from_config(&cfg).is_err());
    }
}
