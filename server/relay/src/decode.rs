//! Feed envelopes and their decoding into `InboundEvent`s.
//!
//! Enumerating the records of a batch is the only fallible step that is fatal
//! for the whole invocation. Everything after that is decided per record.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde_json::{Map, Value};

use crate::{
    errors::{DecodeError, RelayError, RelayResult},
    ids::FeedPosition,
    model::{EventKind, FieldValue, InboundEvent, Payload},
};

/// Row returned by an analytic query. All columns arrive as text.
pub type QueryRow = BTreeMap<String, String>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeedFormat {
    /// Change-data-capture records carrying typed attribute images.
    ChangeStream,
    /// Broker messages whose value is base64-encoded JSON.
    Broker,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RawBody {
    ChangeRecord(Value),
    BrokerMessage(Value),
    Row(QueryRow),
}

/// One feed-native record, enumerated but not yet decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct RawEnvelope {
    pub position: FeedPosition,
    pub body: RawBody,
}

impl RawEnvelope {
    pub fn row(position: FeedPosition, row: QueryRow) -> Self {
        Self { position, body: RawBody::Row(row) }
    }
}

pub fn parse_batch(format: FeedFormat, bytes: &[u8]) -> RelayResult<Vec<RawEnvelope>> {
    let root: Value = serde_json::from_slice(bytes)
        .map_err(|e| RelayError::BatchEnvelope(format!("not json: {e}")))?;
    match format {
        FeedFormat::ChangeStream => change_stream_envelopes(&root),
        FeedFormat::Broker => broker_envelopes(&root),
    }
}

fn change_stream_envelopes(root: &Value) -> RelayResult<Vec<RawEnvelope>> {
    let records = root
        .get("Records")
        .and_then(Value::as_array)
        .ok_or_else(|| RelayError::BatchEnvelope("missing Records array".into()))?;

    Ok(records
        .iter()
        .enumerate()
        .map(|(i, rec)| RawEnvelope {
            position: change_position(rec, i),
            body: RawBody::ChangeRecord(rec.clone()),
        })
        .collect())
}

fn change_position(rec: &Value, index: usize) -> FeedPosition {
    rec.get("dynamodb")
        .and_then(|d| d.get("SequenceNumber"))
        .and_then(Value::as_str)
        .or_else(|| rec.get("eventID").and_then(Value::as_str))
        .map(FeedPosition::new)
        .unwrap_or_else(|| FeedPosition::index(index))
}

fn broker_envelopes(root: &Value) -> RelayResult<Vec<RawEnvelope>> {
    let partitions = root
        .get("records")
        .and_then(Value::as_object)
        .ok_or_else(|| RelayError::BatchEnvelope("missing records map".into()))?;

    // serde_json's Map is ordered by key unless preserve_order is on; sort anyway
    let mut keys: Vec<&String> = partitions.keys().collect();
    keys.sort();

    let mut out = Vec::new();
    for key in keys {
        let messages = partitions[key.as_str()].as_array().ok_or_else(|| {
            RelayError::BatchEnvelope(format!("partition {key} is not an array"))
        })?;
        for (i, msg) in messages.iter().enumerate() {
            out.push(RawEnvelope {
                position: broker_position(key, msg, i),
                body: RawBody::BrokerMessage(msg.clone()),
            });
        }
    }
    Ok(out)
}

fn broker_position(key: &str, msg: &Value, index: usize) -> FeedPosition {
    let topic = msg.get("topic").and_then(Value::as_str);
    let partition = msg.get("partition").map(scalar_text);
    let offset = msg.get("offset").map(scalar_text);
    match (topic, partition, offset) {
        (Some(t), Some(p), Some(o)) => FeedPosition::new(format!("{t}-{p}@{o}")),
        (_, _, Some(o)) => FeedPosition::new(format!("{key}@{o}")),
        _ => FeedPosition::new(format!("{key}#{index}")),
    }
}

fn scalar_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Decodes one envelope. Pure.
pub fn decode(env: &RawEnvelope) -> Result<InboundEvent, DecodeError> {
    match &env.body {
        RawBody::ChangeRecord(v) => decode_change_record(v, &env.position),
        RawBody::BrokerMessage(v) => decode_broker_message(v, &env.position),
        RawBody::Row(row) => Ok(InboundEvent::new(
            EventKind::Create,
            row.iter()
                .map(|(k, v)| (k.clone(), FieldValue::Str(v.clone())))
                .collect(),
            env.position.clone(),
        )),
    }
}

fn decode_change_record(v: &Value, position: &FeedPosition) -> Result<InboundEvent, DecodeError> {
    let obj = v
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("record is not an object".into()))?;
    let name = obj
        .get("eventName")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingDiscriminator)?;
    let kind = EventKind::parse(name);

    let change = obj.get("dynamodb");
    let image = change.and_then(|d| d.get("NewImage"));
    let payload = match (kind.produces_records(), image) {
        (_, Some(image)) => decode_image(image)?,
        (true, None) => return Err(DecodeError::Truncated("NewImage")),
        (false, None) => match change.and_then(|d| d.get("Keys")) {
            Some(keys) => decode_image(keys)?,
            None => Payload::new(),
        },
    };
    Ok(InboundEvent::new(kind, payload, position.clone()))
}

fn decode_image(v: &Value) -> Result<Payload, DecodeError> {
    let attrs = v
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("attribute image is not an object".into()))?;
    decode_attribute_map(attrs)
}

fn decode_attribute_map(attrs: &Map<String, Value>) -> Result<Payload, DecodeError> {
    attrs
        .iter()
        .map(|(name, attr)| Ok((name.clone(), decode_attribute(name, attr)?)))
        .collect()
}

fn decode_attribute(name: &str, attr: &Value) -> Result<FieldValue, DecodeError> {
    let malformed = |what: &str| DecodeError::Malformed(format!("attribute {name}: {what}"));

    let tagged = attr.as_object().filter(|o| o.len() == 1).ok_or_else(|| malformed("expected one type tag"))?;
    let (tag, val) = tagged.iter().next().ok_or_else(|| malformed("expected one type tag"))?;

    Ok(match tag.as_str() {
        "S" | "B" => FieldValue::Str(val.as_str().ok_or_else(|| malformed("not a string"))?.to_string()),
        "N" => FieldValue::Number(decimal_text(val).ok_or_else(|| malformed("not a number"))?),
        "BOOL" => FieldValue::Bool(val.as_bool().ok_or_else(|| malformed("not a boolean"))?),
        "NULL" => FieldValue::Null,
        "M" => FieldValue::Map(decode_attribute_map(
            val.as_object().ok_or_else(|| malformed("not a map"))?,
        )?),
        "L" => FieldValue::List(
            val.as_array()
                .ok_or_else(|| malformed("not a list"))?
                .iter()
                .map(|item| decode_attribute(name, item))
                .collect::<Result<_, _>>()?,
        ),
        "SS" | "BS" => FieldValue::List(
            val.as_array()
                .ok_or_else(|| malformed("not a set"))?
                .iter()
                .map(|s| s.as_str().map(|s| FieldValue::Str(s.to_string())))
                .collect::<Option<_>>()
                .ok_or_else(|| malformed("set member is not a string"))?,
        ),
        "NS" => FieldValue::List(
            val.as_array()
                .ok_or_else(|| malformed("not a set"))?
                .iter()
                .map(|n| decimal_text(n).map(FieldValue::Number))
                .collect::<Option<_>>()
                .ok_or_else(|| malformed("set member is not a number"))?,
        ),
        other => return Err(malformed(&format!("unknown type tag {other}"))),
    })
}

/// Number attributes arrive as strings; the text is kept as-is once it looks
/// like a decimal.
fn decimal_text(v: &Value) -> Option<String> {
    let s = match v {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    is_decimal(&s).then_some(s)
}

fn is_decimal(s: &str) -> bool {
    let unsigned = s.strip_prefix(['-', '+']).unwrap_or(s);
    let (mantissa, exponent) = match unsigned.split_once(['e', 'E']) {
        Some((m, e)) => (m, Some(e)),
        None => (unsigned, None),
    };
    let (int, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    let digits = |p: &str| p.bytes().all(|b| b.is_ascii_digit());
    let mantissa_ok = !(int.is_empty() && frac.is_empty()) && digits(int) && digits(frac);
    let exponent_ok = exponent.map_or(true, |e| {
        let e = e.strip_prefix(['-', '+']).unwrap_or(e);
        !e.is_empty() && digits(e)
    });
    mantissa_ok && exponent_ok
}

fn decode_broker_message(v: &Value, position: &FeedPosition) -> Result<InboundEvent, DecodeError> {
    let encoded = v
        .get("value")
        .and_then(Value::as_str)
        .ok_or(DecodeError::Truncated("value"))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| DecodeError::Encoding(format!("base64: {e}")))?;
    let text = std::str::from_utf8(&bytes).map_err(|e| DecodeError::Encoding(format!("utf-8: {e}")))?;
    let json: Value = serde_json::from_str(text).map_err(|e| DecodeError::Malformed(format!("value json: {e}")))?;
    let obj = json
        .as_object()
        .ok_or_else(|| DecodeError::Malformed("value is not a json object".into()))?;

    let payload = obj
        .iter()
        .map(|(k, v)| (k.clone(), FieldValue::from_json(v)))
        .collect();
    Ok(InboundEvent::new(EventKind::Create, payload, position.clone()))
}
