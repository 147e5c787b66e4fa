use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use fp_relay::provision::{FeatureGroupAdmin, FeatureGroupSpec, FeatureGroupStatus, TopicAdmin, TopicConfig};
use tokio::sync::Mutex;
use tracing::info;

/// Logs topic operations instead of calling a broker admin API.
pub struct LogTopicAdmin;

#[async_trait]
impl TopicAdmin for LogTopicAdmin {
    async fn create_topic(&self, cfg: &TopicConfig) -> Result<()> {
        info!(
            topic = %cfg.topic,
            partitions = cfg.num_partitions,
            replication = cfg.replication_factor,
            "create topic"
        );
        Ok(())
    }

    async fn delete_topic(&self, name: &str) -> Result<()> {
        info!(topic = %name, "delete topic");
        Ok(())
    }
}

/// Keeps feature groups in memory for the life of the process. A created group
/// reports `Created` straight away.
#[derive(Default)]
pub struct LogFeatureGroupAdmin {
    groups: Mutex<BTreeMap<String, FeatureGroupSpec>>,
}

#[async_trait]
impl FeatureGroupAdmin for LogFeatureGroupAdmin {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.groups.lock().await.contains_key(name))
    }

    async fn create(&self, spec: &FeatureGroupSpec) -> Result<()> {
        info!(
            feature_group = %spec.name,
            record_identifier = %spec.record_identifier,
            event_time = %spec.event_time,
            offline_store = %spec.offline_store_uri,
            features = spec.features.len(),
            "create feature group"
        );
        self.groups.lock().await.insert(spec.name.clone(), spec.clone());
        Ok(())
    }

    async fn status(&self, name: &str) -> Result<FeatureGroupStatus> {
        if self.groups.lock().await.contains_key(name) {
            Ok(FeatureGroupStatus { state: "Created".to_string(), failure_reason: None })
        } else {
            Err(anyhow!("feature group {name} not found"))
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let removed = self.groups.lock().await.remove(name).is_some();
        info!(feature_group = %name, existed = removed, "delete feature group");
        Ok(())
    }
}
