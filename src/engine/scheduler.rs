//! Scheduled passes
//!
//! Each pass reloads configuration, sweeps the listing sources into the
//! queue, drains it, runs the engine off the async runtime and publishes
//! the result. A configuration failure aborts the pass before anything is
//! drained; a failed publish is kept and retried ahead of the next one.

use super::queue::{IngestQueue, ListingSource};
use super::{BatchOutput, Engine};
use crate::config::ConfigHandle;
use crate::error::{EngineError, Result};
use crate::events::EventBus;
use crate::storage::ResultSink;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Summary of one pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub batch_id: String,
    pub config_generation: u64,
    pub listings: usize,
    pub properties: usize,
    pub events: usize,
    /// False when the sink rejected the output; it is retried next pass
    pub published: bool,
}

pub struct Scheduler {
    config: Arc<ConfigHandle>,
    engine: Arc<Engine>,
    queue: Arc<IngestQueue>,
    sink: Arc<dyn ResultSink>,
    sources: Vec<Arc<dyn ListingSource>>,
    bus: Option<Arc<EventBus>>,
    /// Outputs the sink has not accepted yet, oldest first
    unpublished: tokio::sync::Mutex<Vec<BatchOutput>>,
}

impl Scheduler {
    pub fn new(
        config: Arc<ConfigHandle>,
        engine: Arc<Engine>,
        queue: Arc<IngestQueue>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            config,
            engine,
            queue,
            sink,
            sources: Vec::new(),
            bus: None,
            unpublished: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn ListingSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub async fn unpublished_len(&self) -> usize {
        self.unpublished.lock().await.len()
    }

    /// Run one pass stamped with `as_of`
    pub async fn run_pass(&self, as_of: DateTime<Utc>) -> Result<PassReport> {
        if let Err(e) = self.config.reload() {
            error!("Pass aborted, configuration rejected: {}", e);
            return Err(e);
        }
        let snapshot = self.config.snapshot();

        for source in &self.sources {
            match source.collect(self.queue.sender()).await {
                Ok(count) if count > 0 => info!("Source {} queued {} listings", source.name(), count),
                Ok(_) => {}
                Err(e) => warn!("Source {} failed: {}", source.name(), e),
            }
        }

        let batch = self.queue.drain();
        let listings = batch.len();
        let retained = batch.clone();

        let engine = Arc::clone(&self.engine);
        let output = match tokio::task::spawn_blocking(move || engine.process_batch(&snapshot, batch, as_of)).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                self.queue.requeue(retained);
                return Err(e);
            }
            Err(e) => {
                self.queue.requeue(retained);
                return Err(EngineError::Internal(format!("batch worker failed: {}", e)));
            }
        };

        let report = PassReport {
            batch_id: output.batch_id.clone(),
            config_generation: output.config_generation,
            listings,
            properties: output.properties.len(),
            events: output.events.len(),
            published: self.publish(output.clone()).await,
        };

        if let Some(bus) = &self.bus {
            bus.publish_all(output.events).await;
        }
        Ok(report)
    }

    /// Hand pending outputs and this one to the sink, in order. Stops at
    /// the first failure so outputs are never published out of order.
    async fn publish(&self, output: BatchOutput) -> bool {
        let mut pending = self.unpublished.lock().await;
        pending.push(output);

        while let Some(next) = pending.first() {
            match self.sink.publish(next).await {
                Ok(()) => {
                    pending.remove(0);
                }
                Err(e) => {
                    warn!("Publishing batch {} failed, will retry: {}", next.batch_id, e);
                    return false;
                }
            }
        }
        true
    }

    /// Pass loop; returns after one pass when `once` is set
    pub async fn run(&self, interval: Duration, once: bool) -> Result<()> {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match self.run_pass(Utc::now()).await {
                Ok(report) => info!(
                    "Pass {}: {} listings, {} properties changed, {} events{}",
                    report.batch_id,
                    report.listings,
                    report.properties,
                    report.events,
                    if report.published { "" } else { " (publish pending)" }
                ),
                Err(e) if once => return Err(e),
                Err(e) => error!("Pass failed: {}", e),
            }
            if once {
                return Ok(());
            }
        }
    }
}
