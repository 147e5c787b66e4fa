use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::model::OutboundRecord;

/// Downstream write contract: one call, one record, one target.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    async fn put(&self, target: &str, record: &OutboundRecord) -> anyhow::Result<()>;
}

#[async_trait::async_trait]
pub trait SinkBuilder: Send + Sync {
    async fn build(&self) -> anyhow::Result<Arc<dyn Sink>>;
}

/// Sink client built on first use and reused afterwards.
///
/// A failed build is not cached: the record that triggered it fails and the
/// next record tries again.
pub struct LazySink<B: SinkBuilder> {
    builder: B,
    client: OnceCell<Arc<dyn Sink>>,
}

impl<B: SinkBuilder> LazySink<B> {
    pub fn new(builder: B) -> Self {
        Self { builder, client: OnceCell::new() }
    }

    pub fn is_built(&self) -> bool {
        self.client.initialized()
    }

    async fn client(&self) -> anyhow::Result<&Arc<dyn Sink>> {
        self.client.get_or_try_init(|| self.builder.build()).await
    }
}

#[async_trait::async_trait]
impl<B: SinkBuilder> Sink for LazySink<B> {
    async fn put(&self, target: &str, record: &OutboundRecord) -> anyhow::Result<()> {
        let client = self.client().await?;
        client.put(target, record).await
    }
}
