use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Host-level prometheus metrics.
pub struct HostMetrics {
    /// Number of managed entity records on this host.
    pub managed_entities: IntGauge,
    /// Invocations registered for retirement and not yet retired.
    pub inflight_invocations: IntGauge,
    /// Total requests retired back to their originators.
    pub retired_requests: IntCounter,
    /// Total lifecycle requests processed.
    pub lifecycle_requests: IntCounter,
}

impl HostMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let managed_entities = IntGauge::with_opts(Opts::new(
            "entity_host_managed_entities",
            "Number of managed entity records",
        ))?;
        let inflight_invocations = IntGauge::with_opts(Opts::new(
            "entity_host_inflight_invocations",
            "Invocations awaiting retirement",
        ))?;
        let retired_requests = IntCounter::with_opts(Opts::new(
            "entity_host_retired_requests_total",
            "Requests retired to their originators",
        ))?;
        let lifecycle_requests = IntCounter::with_opts(Opts::new(
            "entity_host_lifecycle_requests_total",
            "Lifecycle requests processed",
        ))?;

        registry.register(Box::new(managed_entities.clone()))?;
        registry.register(Box::new(inflight_invocations.clone()))?;
        registry.register(Box::new(retired_requests.clone()))?;
        registry.register(Box::new(lifecycle_requests.clone()))?;

        Ok(Self {
            managed_entities,
            inflight_invocations,
            retired_requests,
            lifecycle_requests,
        })
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self {
            managed_entities: IntGauge::new("entity_host_managed_entities", "entities")
                .expect("valid metric name"),
            inflight_invocations: IntGauge::new("entity_host_inflight_invocations", "inflight")
                .expect("valid metric name"),
            retired_requests: IntCounter::new("entity_host_retired_requests_total", "retired")
                .expect("valid metric name"),
            lifecycle_requests: IntCounter::new("entity_host_lifecycle_requests_total", "lifecycle")
                .expect("valid metric name"),
        }
    }
}
