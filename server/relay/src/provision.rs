//! Custom-resource handlers that create and delete broker topics and feature
//! groups for the infrastructure stack.
//!
//! Failures are reported in the response rather than returned, the stack is
//! waiting on that response either way.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unknown request type - {0}")]
    UnknownRequestType(String),

    #[error("failed to create feature group {name}: {status}, reason: {reason}")]
    CreationFailed { name: String, status: String, reason: String },

    #[error("feature group {0} still creating after {1:?}")]
    CreationTimedOut(String, Duration),

    #[error(transparent)]
    Admin(#[from] anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestType {
    Create,
    Update,
    Delete,
}

impl RequestType {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Create" => RequestType::Create,
            "Update" => RequestType::Update,
            "Delete" => RequestType::Delete,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionStatus {
    Success,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct ProvisionResponse {
    pub status: ProvisionStatus,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ProvisionResponse {
    fn success(data: Value) -> Self {
        Self { status: ProvisionStatus::Success, data, reason: None }
    }

    fn failed(data: Value, err: &ProvisionError) -> Self {
        Self {
            status: ProvisionStatus::Failed,
            data,
            reason: Some(err.to_string()),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawRequest {
    request_type: String,
    resource_properties: Value,
}

/// Splits a custom-resource request into its type and one named property.
fn parse_request<T: for<'de> Deserialize<'de>>(
    raw: &Value,
    property: &str,
) -> Result<(String, T, Value), ProvisionError> {
    let req = RawRequest::deserialize(raw).map_err(|e| ProvisionError::BadRequest(e.to_string()))?;
    let prop = req
        .resource_properties
        .get(property)
        .cloned()
        .ok_or_else(|| ProvisionError::BadRequest(format!("missing ResourceProperties.{property}")))?;
    let parsed = T::deserialize(&prop).map_err(|e| ProvisionError::BadRequest(format!("{property}: {e}")))?;
    Ok((req.request_type, parsed, prop))
}

fn int_or_string<'de, D, N>(d: D) -> Result<N, D::Error>
where
    D: Deserializer<'de>,
    N: std::str::FromStr + TryFrom<i64>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Text(String),
    }
    match Raw::deserialize(d)? {
        Raw::Int(n) => N::try_from(n).map_err(|_| serde::de::Error::custom(format!("{n} out of range"))),
        Raw::Text(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("{s:?} is not an integer"))),
    }
}

// -----------------------------------------------------------------------------
// Topics
// -----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicConfig {
    pub topic: String,
    #[serde(deserialize_with = "int_or_string")]
    pub num_partitions: i32,
    #[serde(deserialize_with = "int_or_string")]
    pub replication_factor: i16,
}

#[async_trait::async_trait]
pub trait TopicAdmin: Send + Sync {
    async fn create_topic(&self, cfg: &TopicConfig) -> anyhow::Result<()>;
    async fn delete_topic(&self, name: &str) -> anyhow::Result<()>;
}

pub async fn handle_topic_request(admin: &dyn TopicAdmin, raw: &Value) -> ProvisionResponse {
    let (request_type, cfg, prop) = match parse_request::<TopicConfig>(raw, "topicConfig") {
        Ok(parts) => parts,
        Err(e) => {
            error!(error = %e, "topic request rejected");
            return ProvisionResponse::failed(json!({}), &e);
        }
    };
    let data = json!({ "topicConfig": prop });

    let res = match RequestType::parse(&request_type) {
        Some(RequestType::Create | RequestType::Update) => {
            info!(topic = %cfg.topic, partitions = cfg.num_partitions, replication = cfg.replication_factor, "creating topic");
            admin.create_topic(&cfg).await.map_err(ProvisionError::from)
        }
        Some(RequestType::Delete) => {
            info!(topic = %cfg.topic, "deleting topic");
            admin.delete_topic(&cfg.topic).await.map_err(ProvisionError::from)
        }
        None => Err(ProvisionError::UnknownRequestType(request_type)),
    };

    match res {
        Ok(()) => ProvisionResponse::success(data),
        Err(e) => {
            error!(topic = %cfg.topic, error = %e, "topic request failed");
            ProvisionResponse::failed(data, &e)
        }
    }
}

// -----------------------------------------------------------------------------
// Feature groups
// -----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureGroupConfig {
    pub feature_group_name: String,
    pub creation_role_arn: String,
    pub offline_store_bucket_name: String,
    pub feature_attributes: Vec<String>,
    #[serde(default)]
    pub feature_data_types: BTreeMap<String, String>,
    pub record_identifier: String,
    pub event_time: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum FeatureType {
    Integral,
    Fractional,
    String,
}

impl FeatureType {
    /// Column dtype names as written in the stack config.
    pub fn from_dtype(dtype: &str) -> Self {
        let d = dtype.to_ascii_lowercase();
        if d.starts_with("int") || d.starts_with("uint") {
            FeatureType::Integral
        } else if d.starts_with("float") || d == "double" {
            FeatureType::Fractional
        } else {
            FeatureType::String
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FeatureDefinition {
    pub name: String,
    pub feature_type: FeatureType,
}

/// Everything an admin client needs to create one feature group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureGroupSpec {
    pub name: String,
    pub role_arn: String,
    pub offline_store_uri: String,
    pub record_identifier: String,
    pub event_time: String,
    pub features: Vec<FeatureDefinition>,
    pub enable_online_store: bool,
}

impl FeatureGroupConfig {
    pub fn spec(&self) -> Result<FeatureGroupSpec, ProvisionError> {
        for key in [&self.record_identifier, &self.event_time] {
            if !self.feature_attributes.contains(key) {
                return Err(ProvisionError::BadRequest(format!("{key} is not a feature attribute")));
            }
        }
        let features = self
            .feature_attributes
            .iter()
            .map(|name| FeatureDefinition {
                name: name.clone(),
                feature_type: self
                    .feature_data_types
                    .get(name)
                    .map(|d| FeatureType::from_dtype(d))
                    .unwrap_or(FeatureType::String),
            })
            .collect();
        Ok(FeatureGroupSpec {
            name: self.feature_group_name.clone(),
            role_arn: self.creation_role_arn.clone(),
            offline_store_uri: format!("s3://{}/{}", self.offline_store_bucket_name, self.feature_group_name),
            record_identifier: self.record_identifier.clone(),
            event_time: self.event_time.clone(),
            features,
            enable_online_store: true,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureGroupStatus {
    pub state: String,
    pub failure_reason: Option<String>,
}

#[async_trait::async_trait]
pub trait FeatureGroupAdmin: Send + Sync {
    async fn exists(&self, name: &str) -> anyhow::Result<bool>;
    async fn create(&self, spec: &FeatureGroupSpec) -> anyhow::Result<()>;
    async fn status(&self, name: &str) -> anyhow::Result<FeatureGroupStatus>;
    async fn delete(&self, name: &str) -> anyhow::Result<()>;
}

pub struct FeatureGroupProvisioner {
    admin: Arc<dyn FeatureGroupAdmin>,
    poll_interval: Duration,
    max_wait: Duration,
}

impl FeatureGroupProvisioner {
    pub fn new(admin: Arc<dyn FeatureGroupAdmin>) -> Self {
        Self {
            admin,
            poll_interval: Duration::from_secs(5),
            max_wait: Duration::from_secs(600),
        }
    }

    pub fn with_polling(mut self, interval: Duration, max_wait: Duration) -> Self {
        self.poll_interval = interval;
        self.max_wait = max_wait;
        self
    }

    pub async fn handle(&self, raw: &Value) -> ProvisionResponse {
        let (request_type, cfg, prop) = match parse_request::<FeatureGroupConfig>(raw, "fgConfig") {
            Ok(parts) => parts,
            Err(e) => {
                error!(error = %e, "feature group request rejected");
                return ProvisionResponse::failed(json!({}), &e);
            }
        };
        let data = json!({ "fgConfig": prop });
        let name = cfg.feature_group_name.clone();

        let res = match RequestType::parse(&request_type) {
            Some(RequestType::Create | RequestType::Update) => self.ensure(&cfg).await,
            Some(RequestType::Delete) => {
                info!(feature_group = %name, "deleting feature group");
                self.admin.delete(&name).await.map_err(ProvisionError::from)
            }
            None => Err(ProvisionError::UnknownRequestType(request_type)),
        };

        match res {
            Ok(()) => ProvisionResponse::success(data),
            Err(e) => {
                error!(feature_group = %name, error = %e, "feature group request failed");
                ProvisionResponse::failed(data, &e)
            }
        }
    }

    /// Create and Update both end up here: an existing group is left alone.
    async fn ensure(&self, cfg: &FeatureGroupConfig) -> Result<(), ProvisionError> {
        let name = &cfg.feature_group_name;
        if self.admin.exists(name).await? {
            info!(feature_group = %name, "feature group already exists, skipping creation");
            return Ok(());
        }
        let spec = cfg.spec()?;
        info!(feature_group = %name, features = spec.features.len(), "creating feature group");
        self.admin.create(&spec).await?;
        self.wait_created(name).await
    }

    async fn wait_created(&self, name: &str) -> Result<(), ProvisionError> {
        let started = Instant::now();
        loop {
            let status = self.admin.status(name).await?;
            match status.state.as_str() {
                "Creating" => {
                    if started.elapsed() >= self.max_wait {
                        return Err(ProvisionError::CreationTimedOut(name.to_string(), self.max_wait));
                    }
                    info!(feature_group = %name, "waiting for feature group to be created");
                    sleep(self.poll_interval).await;
                }
                "Created" => {
                    info!(feature_group = %name, "feature group created");
                    return Ok(());
                }
                other => {
                    return Err(ProvisionError::CreationFailed {
                        name: name.to_string(),
                        status: other.to_string(),
                        reason: status.failure_reason.unwrap_or_default(),
                    })
                }
            }
        }
    }
}
