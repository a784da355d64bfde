//! Prometheus metrics for the HTTP surface.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

use crate::inference::stream::GenerationOutcome;

/// Counters exported on `GET /metrics`.
pub struct ServerMetrics {
    registry: Registry,
    generations: IntCounterVec,
    pieces: IntCounter,
    model_loads: IntCounterVec,
}

impl ServerMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let generations = IntCounterVec::new(
            Opts::new("generations_total", "Finished generations by finish reason"),
            &["finish_reason"],
        )?;
        let pieces = IntCounter::new("generated_pieces_total", "Text pieces streamed to clients")?;
        let model_loads = IntCounterVec::new(
            Opts::new("model_loads_total", "Model loads by result"),
            &["result"],
        )?;

        registry.register(Box::new(generations.clone()))?;
        registry.register(Box::new(pieces.clone()))?;
        registry.register(Box::new(model_loads.clone()))?;

        Ok(Self {
            registry,
            generations,
            pieces,
            model_loads,
        })
    }

    pub fn record_outcome(&self, outcome: &GenerationOutcome) {
        self.generations
            .with_label_values(&[outcome.end.as_str()])
            .inc();
        self.pieces.inc_by(outcome.pieces as u64);
    }

    pub fn record_load(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.model_loads.with_label_values(&[result]).inc();
    }

    /// Render every registered metric in the text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}
