//! Prometheus metrics for requests and stages.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};

use crate::request::OutputKind;

pub struct Metrics {
    registry: Registry,
    requests: IntCounterVec,
    stages: IntCounterVec,
    stage_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let requests = IntCounterVec::new(
            Opts::new("promptforge_requests_total", "Generation requests by outcome"),
            &["outcome"],
        )?;
        let stages = IntCounterVec::new(
            Opts::new("promptforge_stages_total", "Pipeline stages by kind and outcome"),
            &["kind", "outcome"],
        )?;
        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "promptforge_stage_duration_seconds",
                "Wall time of successful stages",
            )
            .buckets(vec![0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            &["kind"],
        )?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(stages.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;

        Ok(Self {
            registry,
            requests,
            stages,
            stage_duration,
        })
    }

    pub fn record_request(&self, ok: bool) {
        self.requests.with_label_values(&[outcome(ok)]).inc();
    }

    pub fn record_stage(&self, kind: OutputKind, ok: bool, seconds: f64) {
        self.stages
            .with_label_values(&[kind.as_str(), outcome(ok)])
            .inc();
        if ok {
            self.stage_duration
                .with_label_values(&[kind.as_str()])
                .observe(seconds);
        }
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buf) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buf).into_owned()
    }
}

fn outcome(ok: bool) -> &'static str {
    if ok {
        "success"
    } else {
        "failure"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_recorded_series() {
        let metrics = Metrics::new().unwrap();
        metrics.record_request(true);
        metrics.record_stage(OutputKind::Depth, true, 0.2);
        metrics.record_stage(OutputKind::Mesh, false, 1.0);

        let text = metrics.render();
        assert!(text.contains("promptforge_requests_total{outcome=\"success\"} 1"));
        assert!(text.contains("promptforge_stages_total{kind=\"mesh\",outcome=\"failure\"} 1"));
        assert!(text.contains("promptforge_stage_duration_seconds_count{kind=\"depth\"} 1"));
        assert!(!text.contains("promptforge_stage_duration_seconds_count{kind=\"mesh\"}"));
    }
}
