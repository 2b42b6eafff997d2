use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

/// Process-wide counters, registered on a registry owned by the app state.
pub struct Metrics {
    registry: Registry,
    /// Labels: `source` (platform, processor), `outcome`.
    pub webhooks_received: IntCounterVec,
    /// Labels: `kind`, `outcome` (ok, retried, exhausted, failed).
    pub jobs: IntCounterVec,
    /// Labels: `outcome` (rates, empty).
    pub quotes: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("dropsplit".to_string()), None)?;

        let webhooks_received = IntCounterVec::new(
            Opts::new("webhooks_received_total", "Inbound webhooks by source and outcome"),
            &["source", "outcome"],
        )?;
        let jobs = IntCounterVec::new(
            Opts::new("jobs_total", "Job executions by kind and outcome"),
            &["kind", "outcome"],
        )?;
        let quotes = IntCounterVec::new(
            Opts::new("rate_quotes_total", "Carrier-service quotes by outcome"),
            &["outcome"],
        )?;

        registry.register(Box::new(webhooks_received.clone()))?;
        registry.register(Box::new(jobs.clone()))?;
        registry.register(Box::new(quotes.clone()))?;

        Ok(Self {
            registry,
            webhooks_received,
            jobs,
            quotes,
        })
    }

    pub fn webhook(&self, source: &str, outcome: &str) {
        self.webhooks_received.with_label_values(&[source, outcome]).inc();
    }

    pub fn job(&self, kind: &str, outcome: &str) {
        self.jobs.with_label_values(&[kind, outcome]).inc();
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_prefixed_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.webhook("processor", "accepted");
        metrics.job("route_fulfillment_order", "exhausted");

        let text = metrics.render().unwrap();
        let line = text
            .lines()
            .find(|l| l.starts_with("dropsplit_webhooks_received_total{"))
            .unwrap();
        assert!(line.contains("source=\"processor\""));
        assert!(line.ends_with(" 1"));
        assert!(text.contains("dropsplit_jobs_total"));
    }
}
