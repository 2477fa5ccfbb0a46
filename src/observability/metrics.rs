use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub polls_total: IntCounterVec,
    pub poll_latency_seconds: HistogramVec,
    pub session_teardowns_total: IntCounterVec,
    pub active_heartbeats: IntGauge,
    pub active_location_watches: IntGauge,
    pub active_event_streams: IntGauge,
    pub active_order_pollers: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let polls_total = IntCounterVec::new(
            Opts::new("polls_total", "Background fetches by kind and outcome"),
            &["kind", "outcome"],
        )
        .expect("valid polls_total metric");

        let poll_latency_seconds = HistogramVec::new(
            HistogramOpts::new("poll_latency_seconds", "Latency of background fetches"),
            &["kind"],
        )
        .expect("valid poll_latency_seconds metric");

        let session_teardowns_total = IntCounterVec::new(
            Opts::new(
                "session_teardowns_total",
                "Sessions cleared after an unauthorized response",
            ),
            &["role"],
        )
        .expect("valid session_teardowns_total metric");

        let active_heartbeats =
            IntGauge::new("active_heartbeats", "Running presence heartbeat timers")
                .expect("valid active_heartbeats metric");

        let active_location_watches = IntGauge::new(
            "active_location_watches",
            "Running location watches publishing driver fixes",
        )
        .expect("valid active_location_watches metric");

        let active_event_streams =
            IntGauge::new("active_event_streams", "Open order event streams")
                .expect("valid active_event_streams metric");

        let active_order_pollers =
            IntGauge::new("active_order_pollers", "Running order status pollers")
                .expect("valid active_order_pollers metric");

        registry
            .register(Box::new(polls_total.clone()))
            .expect("register polls_total");
        registry
            .register(Box::new(poll_latency_seconds.clone()))
            .expect("register poll_latency_seconds");
        registry
            .register(Box::new(session_teardowns_total.clone()))
            .expect("register session_teardowns_total");
        registry
            .register(Box::new(active_heartbeats.clone()))
            .expect("register active_heartbeats");
        registry
            .register(Box::new(active_location_watches.clone()))
            .expect("register active_location_watches");
        registry
            .register(Box::new(active_event_streams.clone()))
            .expect("register active_event_streams");
        registry
            .register(Box::new(active_order_pollers.clone()))
            .expect("register active_order_pollers");

        Self {
            registry,
            polls_total,
            poll_latency_seconds,
            session_teardowns_total,
            active_heartbeats,
            active_location_watches,
            active_event_streams,
            active_order_pollers,
        }
    }

    pub fn record_poll(&self, kind: &str, outcome: &str, elapsed_secs: f64) {
        self.polls_total.with_label_values(&[kind, outcome]).inc();
        self.poll_latency_seconds
            .with_label_values(&[kind])
            .observe(elapsed_secs);
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
