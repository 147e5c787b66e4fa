use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use serde_json::{json, Value};

pub const MSG_TYPE: &str = "COUPON_VALIDATE";

const LOCATIONS: &[&str] = &[
    "loc0000", "loc0001", "loc0002", "loc0003", "loc0004", "loc0005", "loc0006", "loc0007", "loc0008", "loc0009",
];
const FRAUD_DEVICE: &str = "user0000";
const FRAUD_LOCATION: &str = "loc0000";

/// Message ids: a fixed prefix followed by a sequence starting at 1.
#[derive(Debug, Clone)]
pub struct MsgIdSequence {
    prefix: String,
    seq: u64,
}

impl MsgIdSequence {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into(), seq: 0 }
    }

    /// `A<unix seconds>`, so separate runs do not collide.
    pub fn from_clock(now: DateTime<Utc>) -> Self {
        Self::new(format!("A{}", now.timestamp()))
    }

    pub fn next_id(&mut self) -> String {
        self.seq += 1;
        format!("{}{}", self.prefix, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CouponMessage {
    pub msg_id: String,
    pub msg_type: String,
    pub device_id: String,
    pub location_code: String,
    pub coupon_code: String,
    pub response: String,
    pub create_time: String,
}

impl CouponMessage {
    /// Change-stream insert record carrying this message as its new image.
    pub fn to_change_record(&self, seq: u64) -> Value {
        let image: serde_json::Map<String, Value> = match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields.into_iter().map(|(k, v)| (k, json!({ "S": v }))).collect(),
            _ => serde_json::Map::new(),
        };

        json!({
            "eventID": format!("{seq:032x}"),
            "eventName": "INSERT",
            "dynamodb": {
                "Keys": { "msg_id": { "S": self.msg_id } },
                "SequenceNumber": seq.to_string(),
                "NewImage": image,
            }
        })
    }
}

pub fn coupon_code<R: Rng>(rng: &mut R) -> String {
    let digits: String = (0..16).map(|_| char::from(b'0' + rng.gen_range(0..10u8))).collect();
    format!("{}-{}-{}-{}", &digits[0..4], &digits[4..8], &digits[8..12], &digits[12..16])
}

fn create_time(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}

pub fn valid_message<R: Rng>(ids: &mut MsgIdSequence, rng: &mut R, now: DateTime<Utc>) -> CouponMessage {
    CouponMessage {
        msg_id: ids.next_id(),
        msg_type: MSG_TYPE.to_string(),
        device_id: format!("user{:04}", rng.gen_range(1000..10000)),
        location_code: LOCATIONS[rng.gen_range(0..LOCATIONS.len())].to_string(),
        coupon_code: coupon_code(rng),
        response: "VALID".to_string(),
        create_time: create_time(now),
    }
}

/// Repeated attempts from one device against codes that share the prefix of
/// `base_code` and differ only in a running 4-digit suffix.
pub struct FraudAttack {
    prefix: String,
    attempt: u32,
}

impl FraudAttack {
    pub fn new(base_code: &str) -> Self {
        let cut = base_code.len().saturating_sub(4);
        let prefix = base_code.get(..cut).unwrap_or_default().to_string();
        Self { prefix, attempt: 0 }
    }

    pub fn next_message(&mut self, ids: &mut MsgIdSequence, now: DateTime<Utc>) -> CouponMessage {
        let code = format!("{}{:04}", self.prefix, self.attempt % 10_000);
        self.attempt += 1;
        CouponMessage {
            msg_id: ids.next_id(),
            msg_type: MSG_TYPE.to_string(),
            device_id: FRAUD_DEVICE.to_string(),
            location_code: FRAUD_LOCATION.to_string(),
            coupon_code: code,
            response: "INVALID".to_string(),
            create_time: create_time(now),
        }
    }
}

pub fn change_batch(messages: &[CouponMessage]) -> Value {
    let records: Vec<Value> = messages
        .iter()
        .enumerate()
        .map(|(i, m)| m.to_change_record(i as u64 + 1))
        .collect();
    json!({ "Records": records })
}
