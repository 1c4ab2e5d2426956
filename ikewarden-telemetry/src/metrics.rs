//! ## ikewarden-telemetry::metrics
//! **Prometheus counters for the liveness core**

use prometheus::{IntCounter, IntGauge, Registry};

#[derive(Debug, Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub sa_created: IntCounter,
    pub sa_destroyed: IntCounter,
    pub sa_live: IntGauge,
    pub dpd_probes_sent: IntCounter,
    pub dpd_acks_accepted: IntCounter,
    pub dpd_rejected: IntCounter,
    pub retransmits: IntCounter,
    pub retransmits_exhausted: IntCounter,
    pub connection_checks: IntCounter,
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("valid metric definition");
    registry
        .register(Box::new(counter.clone()))
        .expect("metric names are unique");
    counter
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let registry = Registry::new();

        let sa_live = IntGauge::new("ikewarden_sa_live", "Security associations currently live")
            .expect("valid metric definition");
        registry
            .register(Box::new(sa_live.clone()))
            .expect("metric names are unique");

        Self {
            sa_created: counter(&registry, "ikewarden_sa_created_total", "SAs created"),
            sa_destroyed: counter(&registry, "ikewarden_sa_destroyed_total", "SAs destroyed"),
            sa_live,
            dpd_probes_sent: counter(
                &registry,
                "ikewarden_dpd_probes_sent_total",
                "R-U-THERE notifies sent",
            ),
            dpd_acks_accepted: counter(
                &registry,
                "ikewarden_dpd_acks_accepted_total",
                "R-U-THERE-ACK notifies accepted",
            ),
            dpd_rejected: counter(
                &registry,
                "ikewarden_dpd_rejected_total",
                "DPD notifies dropped as malformed, spoofed or replayed",
            ),
            retransmits: counter(
                &registry,
                "ikewarden_retransmits_total",
                "Message transmissions after the first",
            ),
            retransmits_exhausted: counter(
                &registry,
                "ikewarden_retransmits_exhausted_total",
                "Messages abandoned after the retransmit limit",
            ),
            connection_checks: counter(
                &registry,
                "ikewarden_connection_checks_total",
                "Periodic connection checks run",
            ),
            registry,
        }
    }

    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
