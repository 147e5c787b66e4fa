use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use std::io::Write;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

mod generator;

use generator::{change_batch, valid_message, FraudAttack, MsgIdSequence};

#[derive(Parser, Debug, Clone)]
#[command(name = "fp-sample-feed", about = "Sample coupon-validation change-stream batch generator")]
struct Args {
    /// Valid messages in the batch
    #[arg(long, default_value_t = 10)]
    count: usize,

    /// Fraudulent attempts appended after the valid messages
    #[arg(long, default_value_t = 0)]
    fraud_count: usize,

    /// Coupon code whose prefix the fraudulent attempts reuse
    #[arg(long, default_value = "9945-4485-5524-4452")]
    fraud_coupon_code: String,

    /// Message id prefix (defaults to A<unix seconds>)
    #[arg(long)]
    id_prefix: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let now = Utc::now();
    let mut ids = match &args.id_prefix {
        Some(p) => MsgIdSequence::new(p.clone()),
        None => MsgIdSequence::from_clock(now),
    };
    let mut rng = rand::thread_rng();

    let mut messages: Vec<_> = (0..args.count).map(|_| valid_message(&mut ids, &mut rng, now)).collect();
    let mut attack = FraudAttack::new(&args.fraud_coupon_code);
    messages.extend((0..args.fraud_count).map(|_| attack.next_message(&mut ids, now)));

    let batch = change_batch(&messages);
    let mut out = std::io::stdout().lock();
    serde_json::to_writer(&mut out, &batch).context("write batch")?;
    writeln!(out).context("write batch")?;

    info!(valid = args.count, fraud = args.fraud_count, "batch written");
    Ok(())
}
