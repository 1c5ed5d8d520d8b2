//! MOSB Pipeline - replay or consume raw shipment events
//!
//! `pipeline replay [FILE]` feeds newline-delimited JSON payloads (from FILE
//! or stdin) through the pipeline and prints the resulting projections.
//! `pipeline consume` reads the raw-events topic from Kafka and relays the
//! annotated events (requires the `kafka` feature).

use anyhow::{Context, Result};
use mosb_pipeline::prelude::*;
use serde_json::json;
use std::io::BufRead;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Ingest every line of `reader`; undecodable lines are logged and skipped.
fn replay_lines(pipeline: &Pipeline, reader: impl BufRead) -> Result<usize> {
    let mut admitted = 0;
    for (n, line) in reader.lines().enumerate() {
        let line = line.context("Failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        match decode_payload(line.as_bytes()) {
            Ok(raws) => admitted += pipeline.ingest(raws).admitted.len(),
            Err(e) => warn!(line = n + 1, error = %e, "Skipping undecodable line"),
        }
    }
    Ok(admitted)
}

fn run_replay(pipeline: Pipeline, path: Option<&str>) -> Result<()> {
    let admitted = match path {
        Some(p) => {
            let file = std::fs::File::open(p).with_context(|| format!("Failed to open {p}"))?;
            replay_lines(&pipeline, std::io::BufReader::new(file))?
        }
        None => replay_lines(&pipeline, std::io::stdin().lock())?,
    };

    let now = now_millis();
    let report = json!({
        "admitted": admitted,
        "stored": pipeline.len(),
        "events": pipeline.events(None),
        "shipments": pipeline.shipments().as_slice(),
        "eta": pipeline.eta_wedges(now),
        "heatmap": pipeline.heatmap(&HeatmapFilter::default()),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    info!(admitted, stored = pipeline.len(), "Replay finished");
    Ok(())
}

#[cfg(feature = "kafka")]
async fn run_consumer(pipeline: Pipeline, config: PipelineConfig) -> Result<()> {
    use mosb_pipeline::{relay_annotated, ConsumerBuilder, EventProducer};
    use std::sync::Arc;

    config.kafka.validate()?;
    let pipeline = Arc::new(pipeline);
    let producer = Arc::new(EventProducer::new(config.kafka.clone())?);

    let consumer = ConsumerBuilder::new(config.kafka.clone())
        .with_dlq_producer(Arc::clone(&producer))
        .build()?;
    consumer.subscribe_raw_events()?;

    let relay = tokio::spawn(relay_annotated(Arc::clone(&producer), pipeline.subscribe()));

    let shutdown = consumer.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Received Ctrl+C, shutting down...");
        let _ = shutdown.send(());
    });

    // Window prune runs alongside consumption
    let pruner = {
        let pipeline = Arc::clone(&pipeline);
        let prune_interval = config.prune_interval();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(prune_interval);
            loop {
                tick.tick().await;
                pipeline.prune_window(now_millis());
            }
        })
    };

    consumer.run(Arc::new(IngestHandler::new(Arc::clone(&pipeline)))).await?;

    pruner.abort();
    relay.abort();
    info!("Consumer finished");
    Ok(())
}

#[cfg(not(feature = "kafka"))]
async fn run_consumer(_pipeline: Pipeline, _config: PipelineConfig) -> Result<()> {
    anyhow::bail!("consume mode requires building with --features kafka")
}

fn print_usage() {
    println!("Usage: pipeline [replay [FILE]|consume]");
    println!();
    println!("Modes:");
    println!("  replay   - Ingest newline-delimited JSON events from FILE or stdin and print projections");
    println!("  consume  - Ingest from the Kafka raw-events topic and relay annotated events");
    println!();
    println!("Configuration: config/pipeline.*, /etc/mosb/pipeline.*, MOSB__* environment variables");
    println!("  MOSB__STORE__CAPACITY          - Max retained events (default: 1000)");
    println!("  MOSB__DATA__ZONES_PATH         - GeoJSON zone file");
    println!("  MOSB__DATA__LOCATIONS_CSV      - Locations table");
    println!("  MOSB__DATA__LEGS_CSV           - Legs table");
    println!("  MOSB__KAFKA__BOOTSTRAP_SERVERS - Kafka broker addresses (default: localhost:9092)");
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args: Vec<String> = std::env::args().collect();
    let mode = args.get(1).map(|s| s.as_str()).unwrap_or("replay");
    if !matches!(mode, "replay" | "consume") {
        print_usage();
        return Ok(());
    }

    let config = PipelineConfig::load().context("Failed to load configuration")?;
    let pipeline = Pipeline::from_config(&config).context("Failed to initialize pipeline")?;

    match mode {
        "consume" => run_consumer(pipeline, config).await,
        _ => run_replay(pipeline, args.get(2).map(|s| s.as_str())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_lines_skips_bad_input() {
        let pipeline = Pipeline::new(PipelineSettings::default(), GeofenceIndex::default(), Default::default()).unwrap();
        let input = concat!(
            r#"{"id":"a","position":[54.4,24.3],"shpt_no":"S1"}"#,
            "\n\n",
            "garbage\n",
            r#"[{"id":"a","position":[54.4,24.3]},{"id":"b","position":[54.5,24.3]}]"#,
            "\n",
        );
        let admitted = replay_lines(&pipeline, input.as_bytes()).unwrap();
        assert_eq!(admitted, 2);
        assert_eq!(pipeline.len(), 2);
    }
}
