//! ## ikewarden-telemetry::logging
//! **Subscriber setup and structured security events**
//!
//! Protocol violations, dead peers and abandoned retransmissions are emitted as
//! `security_event` spans so they can be filtered apart from ordinary
//! lifecycle logging.

use opentelemetry::KeyValue;
use tracing::info_span;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Clone, Debug)]
pub struct EventLogger;

impl EventLogger {
    /// Installs the global subscriber. `RUST_LOG` wins over `default_level`.
    pub fn init(default_level: &str) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
        // A second init (tests, embedding) keeps the first subscriber.
        let _ = fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::NONE)
            .try_init();
    }

    pub fn log_event(event_type: &str, metadata: Vec<KeyValue>) {
        let span = info_span!(
            "security_event",
            event_type = event_type,
            otel.kind = "INTERNAL"
        );
        let _entered = span.enter();

        let fields = metadata
            .iter()
            .map(|kv| format!("{}={}", kv.key.as_str(), kv.value.as_str()))
            .collect::<Vec<_>>()
            .join(" ");
        tracing::warn!(event_type, "Security event: {fields}");
    }
}
