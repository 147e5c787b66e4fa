use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::{
    errors::RecordError,
    ids::{BatchId, FeedPosition},
};

pub const UNSUPPORTED_EVENT_KIND: &str = "unsupported-event-kind";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Create,
    Update,
    Delete,
    Other,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Create => "create",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
            EventKind::Other => "other",
        }
    }

    /// Accepts both change-stream names (`INSERT`, `MODIFY`, `REMOVE`) and our
    /// own lowercase names. Anything else is `Other`.
    pub fn parse(s: &str) -> Self {
        match s {
            "INSERT" | "create" => EventKind::Create,
            "MODIFY" | "update" => EventKind::Update,
            "REMOVE" | "delete" => EventKind::Delete,
            _ => EventKind::Other,
        }
    }

    pub fn produces_records(&self) -> bool {
        matches!(self, EventKind::Create | EventKind::Update)
    }
}

/// Typed payload value. Numbers stay as their decimal text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Str(String),
    Number(String),
    Bool(bool),
    Null,
    List(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

pub type Payload = BTreeMap<String, FieldValue>;

impl FieldValue {
    pub fn from_json(v: &Json) -> Self {
        match v {
            Json::Null => FieldValue::Null,
            Json::Bool(b) => FieldValue::Bool(*b),
            Json::Number(n) => FieldValue::Number(n.to_string()),
            Json::String(s) => FieldValue::Str(s.clone()),
            Json::Array(items) => FieldValue::List(items.iter().map(FieldValue::from_json).collect()),
            Json::Object(o) => FieldValue::Map(
                o.iter()
                    .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// JSON rendering used for nested values. Numbers are emitted as strings
    /// so no precision is lost on the way to string-typed sinks.
    pub fn to_json(&self) -> Json {
        match self {
            FieldValue::Str(s) | FieldValue::Number(s) => Json::String(s.clone()),
            FieldValue::Bool(b) => Json::Bool(*b),
            FieldValue::Null => Json::Null,
            FieldValue::List(items) => Json::Array(items.iter().map(FieldValue::to_json).collect()),
            FieldValue::Map(m) => Json::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// String form written to sinks. `None` for null, which sinks treat as absent.
    pub fn normalize(&self) -> Option<String> {
        match self {
            FieldValue::Str(s) | FieldValue::Number(s) => Some(s.clone()),
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::Null => None,
            FieldValue::List(_) | FieldValue::Map(_) => Some(self.to_json().to_string()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEvent {
    kind: EventKind,
    payload: Payload,
    position: FeedPosition,
}

impl InboundEvent {
    pub fn new(kind: EventKind, payload: Payload, position: FeedPosition) -> Self {
        Self { kind, payload, position }
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn position(&self) -> &FeedPosition {
        &self.position
    }

    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.payload.get(name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OutboundRecord {
    pub target: String,
    pub fields: BTreeMap<String, String>,
}

impl OutboundRecord {
    pub fn to_json(&self) -> Json {
        Json::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), Json::String(v.clone())))
                .collect(),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    Skipped(String),
    Failed(RecordError),
}

impl DeliveryOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            DeliveryOutcome::Delivered => "delivered",
            DeliveryOutcome::Skipped(_) => "skipped",
            DeliveryOutcome::Failed(_) => "failed",
        }
    }

    pub fn detail(&self) -> Option<String> {
        match self {
            DeliveryOutcome::Delivered => None,
            DeliveryOutcome::Skipped(reason) => Some(reason.clone()),
            DeliveryOutcome::Failed(e) => Some(e.to_string()),
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportEntry {
    pub index: usize,
    pub position: FeedPosition,
    pub outcome: DeliveryOutcome,
}

/// Wire/log shape of one report entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportLine {
    pub record_position: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Clone, Debug)]
pub struct BatchReport {
    pub batch_id: BatchId,
    entries: Vec<ReportEntry>,
}

impl BatchReport {
    pub fn new(batch_id: BatchId, entries: Vec<ReportEntry>) -> Self {
        Self { batch_id, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ReportEntry] {
        &self.entries
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &DeliveryOutcome> {
        self.entries.iter().map(|e| &e.outcome)
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut c = OutcomeCounts::default();
        for o in self.outcomes() {
            match o {
                DeliveryOutcome::Delivered => c.delivered += 1,
                DeliveryOutcome::Skipped(_) => c.skipped += 1,
                DeliveryOutcome::Failed(_) => c.failed += 1,
            }
        }
        c
    }

    pub fn lines(&self) -> Vec<ReportLine> {
        self.entries
            .iter()
            .map(|e| ReportLine {
                record_position: e.position.0.clone(),
                status: e.outcome.status().to_string(),
                detail: e.outcome.detail(),
            })
            .collect()
    }

    pub fn to_json(&self) -> Json {
        serde_json::json!({
            "batchId": self.batch_id.to_string(),
            "counts": self.counts(),
            "records": self.lines(),
        })
    }
}
