mod admins;
mod config;
mod engine;
mod handler;
mod metrics_adapter;
mod sinks;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use config::{Config, HandlerKind};
use fp_metrics::{MetricsConfig, MetricsServer};
use fp_relay::provision::FeatureGroupProvisioner;
use fp_relay::{AggregateJob, LazySink, Relay, Sink};
use tokio::io::BufReader;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::admins::{LogFeatureGroupAdmin, LogTopicAdmin};
use crate::engine::SavedResultEngine;
use crate::handler::{Handler, Source};
use crate::metrics_adapter::relay_metrics;
use crate::sinks::SinkFactory;

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the replies; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let cfg = Config::parse();

    // Metrics
    if let Some(listen) = &cfg.metrics_listen {
        let ms = MetricsServer::install(MetricsConfig {
            listen: listen.clone(),
            namespace: "fp",
        })?;
        tokio::spawn(async move {
            if let Err(e) = ms.serve().await {
                warn!(error = %e, "metrics server stopped");
            }
        });
    }

    let source = match cfg.handler {
        HandlerKind::StreamToBroker | HandlerKind::BrokerToStore | HandlerKind::BatchAggregate => {
            relay_source(&cfg)?
        }
        HandlerKind::TopicProvision => Source::Topics(Arc::new(LogTopicAdmin)),
        HandlerKind::FeatureGroupProvision => {
            let (interval, max_wait) = cfg.provision_polling();
            let admin = Arc::new(LogFeatureGroupAdmin::default());
            Source::FeatureGroups(FeatureGroupProvisioner::new(admin).with_polling(interval, max_wait))
        }
    };

    let handler = Handler::new(source, cfg.deadline());
    info!(handler = cfg.handler.as_str(), concurrency = cfg.concurrency, "handler ready");

    let input = BufReader::new(tokio::io::stdin());
    let output = tokio::io::stdout();

    tokio::select! {
        r = handler.serve(input, output) => {
            let stats = r?;
            if stats.rejected > 0 {
                bail!("{} invocation(s) rejected", stats.rejected);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown");
        }
    }

    Ok(())
}

fn relay_source(cfg: &Config) -> Result<Source> {
    // Sink client is built on the first delivery and reused afterwards
    let sink: Arc<dyn Sink> = Arc::new(LazySink::new(SinkFactory::from_config(cfg)?));
    let relay = Relay::with_metrics(cfg.policy(), sink, cfg.relay_config(), relay_metrics(cfg.handler))
        .context("relay config")?;

    match cfg.handler.feed_format() {
        Some(format) => Ok(Source::Feed(relay, format)),
        None => {
            let Some(path) = cfg.query_rows_path.clone() else {
                bail!("--query-rows-path is required for the batch-aggregate handler");
            };
            let engine = Arc::new(SavedResultEngine::new(path));
            let job = AggregateJob::new(engine, cfg.source_table.clone(), cfg.aggregate_offset()?);
            Ok(Source::Aggregate(relay, job))
        }
    }
}
