use metrics::{describe_counter, describe_gauge, describe_histogram};

pub(crate) struct Metric {
    pub name: &'static str,
    description: &'static str,
}

pub(crate) const COUNTERS: [Metric; 7] = [
    RESOURCE_REQUESTS_TOTAL,
    RESOURCE_RETRIES_TOTAL,
    OWNERSHIP_CLAIMS_TOTAL,
    OWNERSHIP_CLAIM_CONFLICTS_TOTAL,
    PARTITION_STEALS_TOTAL,
    EVENTS_PROCESSED_TOTAL,
    PROCESSING_ERRORS_TOTAL,
];
pub(crate) const GAUGES: [Metric; 1] = [PARTITION_PUMPS_ACTIVE];
pub(crate) const HISTOGRAMS: [Metric; 1] = [LOAD_BALANCING_DURATION_SECONDS];

// RESOURCE Metrics --------------------------

pub(crate) const RESOURCE_REQUESTS_TOTAL: Metric = Metric {
    name: "tributary_resource_requests_total",
    description: "Total number of resources (connections, links) requested from upstream",
};

pub(crate) const RESOURCE_RETRIES_TOTAL: Metric = Metric {
    name: "tributary_resource_retries_total",
    description: "Total number of resource errors swallowed and retried after backoff",
};

// OWNERSHIP Metrics --------------------------

pub(crate) const OWNERSHIP_CLAIMS_TOTAL: Metric = Metric {
    name: "tributary_ownership_claims_total",
    description: "Total number of partition ownership claims accepted by the store",
};

pub(crate) const OWNERSHIP_CLAIM_CONFLICTS_TOTAL: Metric = Metric {
    name: "tributary_ownership_claim_conflicts_total",
    description: "Total number of ownership claims lost to a concurrent writer",
};

pub(crate) const PARTITION_STEALS_TOTAL: Metric = Metric {
    name: "tributary_partition_steals_total",
    description: "Total number of partitions claimed away from another active owner",
};

pub(crate) const LOAD_BALANCING_DURATION_SECONDS: Metric = Metric {
    name: "tributary_load_balancing_duration_seconds",
    description: "Duration of a single load balancing pass",
};

// PUMP Metrics --------------------------

pub(crate) const PARTITION_PUMPS_ACTIVE: Metric = Metric {
    name: "tributary_partition_pumps_active",
    description: "Number of partition pumps currently running in this instance",
};

pub(crate) const EVENTS_PROCESSED_TOTAL: Metric = Metric {
    name: "tributary_events_processed_total",
    description: "Total number of events handed to the event handler",
};

pub(crate) const PROCESSING_ERRORS_TOTAL: Metric = Metric {
    name: "tributary_processing_errors_total",
    description: "Total number of errors reported to the event handler",
};

/// Registers descriptions for every client metric with the installed recorder.
pub(crate) fn describe_metrics() {
    for counter in COUNTERS {
        describe_counter!(counter.name, counter.description);
    }
    for gauge in GAUGES {
        describe_gauge!(gauge.name, gauge.description);
    }
    for histogram in HISTOGRAMS {
        describe_histogram!(histogram.name, histogram.description);
    }
}
