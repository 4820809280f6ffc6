//! Remap Metrics
//!
//! Prometheus metrics fed from the remap event stream.

use crate::error::{Error, Result};
use crate::remap::events::{RemapEvent, RemapEventRecord};
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const NAMESPACE: &str = "pvc_remap";

fn registration(e: prometheus::Error) -> Error {
    Error::Internal(format!("metric registration failed: {}", e))
}

/// Operator metrics in a dedicated registry
#[derive(Clone)]
pub struct RemapMetrics {
    registry: Registry,
    events: IntCounterVec,
    switchovers: IntCounterVec,
    passes: IntCounterVec,
    pass_duration: Histogram,
    lagged_events: IntCounter,
    claims_pending: IntGauge,
}

impl RemapMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events = IntCounterVec::new(
            Opts::new("events_total", "Remap events by kind").namespace(NAMESPACE),
            &["kind"],
        )
        .map_err(registration)?;
        let switchovers = IntCounterVec::new(
            Opts::new("switchovers_total", "Switchover requests by result").namespace(NAMESPACE),
            &["result"],
        )
        .map_err(registration)?;
        let passes = IntCounterVec::new(
            Opts::new("passes_total", "Reconciliation passes by result").namespace(NAMESPACE),
            &["result"],
        )
        .map_err(registration)?;
        let pass_duration = Histogram::with_opts(
            HistogramOpts::new("pass_duration_seconds", "Duration of reconciliation passes")
                .namespace(NAMESPACE),
        )
        .map_err(registration)?;
        let lagged_events = IntCounter::with_opts(
            Opts::new("events_lagged_total", "Events dropped by a slow consumer")
                .namespace(NAMESPACE),
        )
        .map_err(registration)?;
        let claims_pending = IntGauge::with_opts(
            Opts::new("claims_pending", "Claims not yet following the naming policy")
                .namespace(NAMESPACE),
        )
        .map_err(registration)?;

        registry.register(Box::new(events.clone())).map_err(registration)?;
        registry.register(Box::new(switchovers.clone())).map_err(registration)?;
        registry.register(Box::new(passes.clone())).map_err(registration)?;
        registry.register(Box::new(pass_duration.clone())).map_err(registration)?;
        registry.register(Box::new(lagged_events.clone())).map_err(registration)?;
        registry.register(Box::new(claims_pending.clone())).map_err(registration)?;

        Ok(Self {
            registry,
            events,
            switchovers,
            passes,
            pass_duration,
            lagged_events,
            claims_pending,
        })
    }

    /// Account for one event
    pub fn observe(&self, record: &RemapEventRecord) {
        self.events.with_label_values(&[record.event.kind()]).inc();
        if let RemapEvent::SwitchoverRequested { done, .. } = &record.event {
            let result = if *done { "done" } else { "incomplete" };
            self.switchovers.with_label_values(&[result]).inc();
        }
    }

    /// Account for a finished pass
    pub fn observe_pass(&self, elapsed: Duration, succeeded: bool) {
        self.pass_duration.observe(elapsed.as_secs_f64());
        let result = if succeeded { "ok" } else { "error" };
        self.passes.with_label_values(&[result]).inc();
    }

    pub fn set_claims_pending(&self, pending: usize) {
        self.claims_pending.set(pending as i64);
    }

    pub fn event_count(&self, kind: &str) -> u64 {
        self.events.with_label_values(&[kind]).get()
    }

    /// Consume `rx` until cancelled or the channel closes
    pub async fn run(&self, mut rx: broadcast::Receiver<RemapEventRecord>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(record) => self.observe(&record),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Metrics consumer lagged behind remap events");
                        self.lagged_events.inc_by(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Metrics consumer stopped");
    }

    /// Text exposition of every metric
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("metric encoding failed: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}
