#![allow(dead_code)]

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};

use fp_relay::{OutboundRecord, Sink};

/// Records every put. Fails records whose `msg_id` is listed in `fail_ids`,
/// and sleeps for `delay_ms` when a record carries that field.
pub struct RecordingSink {
    seen: Mutex<Vec<OutboundRecord>>,
    fail_ids: Vec<String>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::failing(&[])
    }

    pub fn failing(ids: &[&str]) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            fail_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().map(|v| v.len()).unwrap_or_default()
    }

    pub fn msg_ids(&self) -> Vec<String> {
        self.seen
            .lock()
            .map(|v| {
                v.iter()
                    .filter_map(|r| r.fields.get("msg_id").cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn take(&self) -> Vec<OutboundRecord> {
        self.seen
            .lock()
            .map(|mut v| std::mem::take(&mut *v))
            .unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Sink for RecordingSink {
    async fn put(&self, _target: &str, record: &OutboundRecord) -> Result<()> {
        if let Some(ms) = record.fields.get("delay_ms").and_then(|v| v.parse::<u64>().ok()) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        {
            let mut guard = self
                .seen
                .lock()
                .map_err(|_| anyhow::anyhow!("recording sink mutex poisoned"))?;
            guard.push(record.clone());
        }
        if let Some(id) = record.fields.get("msg_id") {
            if self.fail_ids.contains(id) {
                anyhow::bail!("put rejected for {id}");
            }
        }
        Ok(())
    }
}

/// Change-stream record with a string `msg_id`, a timestamp and any extra
/// typed attributes.
pub fn change(event_name: &str, seq: u64, msg_id: Option<&str>, extra: &[(&str, Value)]) -> Value {
    let mut image = serde_json::Map::new();
    if let Some(id) = msg_id {
        image.insert("msg_id".into(), json!({"S": id}));
    }
    image.insert("create_time".into(), json!({"S": "2024-09-01 23:16:01.123456"}));
    for (k, v) in extra {
        image.insert(k.to_string(), v.clone());
    }
    json!({
        "eventID": format!("ev-{seq}"),
        "eventName": event_name,
        "dynamodb": {
            "SequenceNumber": seq.to_string(),
            "NewImage": Value::Object(image),
        }
    })
}

pub fn change_batch(records: Vec<Value>) -> Vec<u8> {
    json!({ "Records": records }).to_string().into_bytes()
}
