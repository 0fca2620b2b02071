use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use tracing::warn;

lazy_static! {
    pub static ref POLLS_CREATED: IntCounter =
        IntCounter::new("polls_created_total", "Total number of polls created")
            .expect("metric can not be created");

    pub static ref VOTES_CAST: IntCounter =
        IntCounter::new("votes_cast_total", "Total number of votes recorded or changed")
            .expect("metric can not be created");

    pub static ref RATE_LIMIT_EXCEEDED: IntCounterVec = IntCounterVec::new(
        Opts::new("rate_limit_exceeded_total", "Total number of rate limit exceeded events"),
        &["bucket"]
    )
    .expect("metric can not be created");

    pub static ref WEBSOCKET_CONNECTIONS: IntGauge =
        IntGauge::new("websocket_connections", "Current number of websocket connections")
            .expect("metric can not be created");

    pub static ref REGISTRY: Registry = {
        let registry = Registry::new();
        registry
            .register(Box::new(POLLS_CREATED.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(VOTES_CAST.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(RATE_LIMIT_EXCEEDED.clone()))
            .expect("collector can be registered");
        registry
            .register(Box::new(WEBSOCKET_CONNECTIONS.clone()))
            .expect("collector can be registered");
        registry
    };
}

/// Prometheus text exposition of every registered metric.
pub fn render() -> String {
    let mut buffer = Vec::new();
    if let Err(err) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        warn!("Failed to encode metrics: {err}");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_rate_limit_counter() {
        RATE_LIMIT_EXCEEDED.with_label_values(&["vote"]).inc();
        let text = render();
        assert!(text.contains("rate_limit_exceeded_total"));
        assert!(text.contains("bucket=\"vote\""));
    }
}
