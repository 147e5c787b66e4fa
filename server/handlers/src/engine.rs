use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use fp_relay::{QueryEngine, QueryRow};
use serde_json::Value;
use tracing::{debug, info};

/// Serves a saved query result from a JSON file in place of a live engine.
///
/// The file holds an array of row objects. Column values are kept as text;
/// null columns are dropped.
pub struct SavedResultEngine {
    path: PathBuf,
}

impl SavedResultEngine {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl QueryEngine for SavedResultEngine {
    async fn run(&self, sql: &str) -> Result<Vec<QueryRow>> {
        debug!(%sql, "query");
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read query result {}", self.path.display()))?;
        let rows = parse_rows(&text)?;
        info!(path = %self.path.display(), rows = rows.len(), "loaded saved query result");
        Ok(rows)
    }
}

fn parse_rows(text: &str) -> Result<Vec<QueryRow>> {
    let value: Value = serde_json::from_str(text).context("query result is not JSON")?;
    let Value::Array(items) = value else {
        bail!("query result must be an array of rows");
    };

    items
        .into_iter()
        .map(|item| match item {
            Value::Object(cols) => Ok(cols
                .into_iter()
                .filter_map(|(k, v)| match v {
                    Value::Null => None,
                    Value::String(s) => Some((k, s)),
                    other => Some((k, other.to_string())),
                })
                .collect()),
            _ => bail!("query result row is not an object"),
        })
        .collect()
}
