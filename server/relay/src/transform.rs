use std::collections::BTreeMap;

use crate::{
    errors::TransformError,
    model::{EventKind, FieldValue, InboundEvent, OutboundRecord, UNSUPPORTED_EVENT_KIND},
    timestamp::normalize_timestamp,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TargetSelector {
    /// Every record goes to each of these targets.
    Fixed(Vec<String>),
    /// The target is read from this payload field, which is then dropped from
    /// the record.
    FromField(String),
}

#[derive(Clone, Debug)]
pub struct TransformPolicy {
    pub targets: TargetSelector,
    pub accepted_kinds: Vec<EventKind>,
    pub required_fields: Vec<String>,
    pub timestamp_fields: Vec<String>,
}

impl TransformPolicy {
    pub fn fixed(targets: Vec<String>) -> Self {
        Self {
            targets: TargetSelector::Fixed(targets),
            accepted_kinds: vec![EventKind::Create, EventKind::Update],
            required_fields: Vec::new(),
            timestamp_fields: Vec::new(),
        }
    }

    pub fn from_field(field: impl Into<String>) -> Self {
        Self {
            targets: TargetSelector::FromField(field.into()),
            ..Self::fixed(Vec::new())
        }
    }

    pub fn require(mut self, fields: &[&str]) -> Self {
        self.required_fields.extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn timestamps(mut self, fields: &[&str]) -> Self {
        self.timestamp_fields.extend(fields.iter().map(|f| f.to_string()));
        self
    }

    pub fn accept(mut self, kinds: &[EventKind]) -> Self {
        self.accepted_kinds = kinds.to_vec();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transformed {
    Records(Vec<OutboundRecord>),
    Skipped(&'static str),
}

pub fn transform(policy: &TransformPolicy, event: &InboundEvent) -> Result<Transformed, TransformError> {
    let kind = event.kind();
    if !kind.produces_records() || !policy.accepted_kinds.contains(&kind) {
        return Ok(Transformed::Skipped(UNSUPPORTED_EVENT_KIND));
    }

    for field in &policy.required_fields {
        match event.field(field) {
            Some(v) if !v.is_null() => {}
            _ => return Err(TransformError::MissingField(field.clone())),
        }
    }

    let target_field = match &policy.targets {
        TargetSelector::FromField(f) => Some(f.as_str()),
        TargetSelector::Fixed(_) => None,
    };

    let mut fields = BTreeMap::new();
    for (name, value) in event.payload() {
        if Some(name.as_str()) == target_field {
            continue;
        }
        let normalized = if policy.timestamp_fields.iter().any(|f| f == name) {
            normalize_timestamp_field(name, value)?
        } else {
            value.normalize()
        };
        if let Some(v) = normalized {
            fields.insert(name.clone(), v);
        }
    }

    let targets = match &policy.targets {
        TargetSelector::Fixed(targets) => targets.clone(),
        TargetSelector::FromField(f) => match event.field(f) {
            Some(FieldValue::Str(t)) if !t.is_empty() => vec![t.clone()],
            Some(FieldValue::Null) | None => return Err(TransformError::MissingField(f.clone())),
            Some(_) => return Err(TransformError::IllTyped(f.clone())),
        },
    };

    Ok(Transformed::Records(
        targets
            .into_iter()
            .map(|target| OutboundRecord { target, fields: fields.clone() })
            .collect(),
    ))
}

fn normalize_timestamp_field(name: &str, value: &FieldValue) -> Result<Option<String>, TransformError> {
    match value {
        FieldValue::Null => Ok(None),
        FieldValue::Str(raw) => normalize_timestamp(raw)
            .map(Some)
            .ok_or_else(|| TransformError::InvalidTimestamp {
                field: name.to_string(),
                value: raw.clone(),
            }),
        _ => Err(TransformError::IllTyped(name.to_string())),
    }
}
