//! Metrics definitions for the project cache.

use shared::metrics_defs::{MetricDef, MetricType};

pub const CACHE_LOOKUP: MetricDef = MetricDef {
    name: "project_cache.lookup",
    metric_type: MetricType::Counter,
    description: "Number of project cache reads, tagged by decision",
};

pub const CACHE_SIZE: MetricDef = MetricDef {
    name: "project_cache.size",
    metric_type: MetricType::Gauge,
    description: "Number of project keys held in the cache",
};

pub const CACHE_EVICTIONS: MetricDef = MetricDef {
    name: "project_cache.evictions",
    metric_type: MetricType::Counter,
    description: "Number of expired entries removed from the cache",
};

pub const FETCH_SCHEDULED: MetricDef = MetricDef {
    name: "project_cache.fetch.scheduled",
    metric_type: MetricType::Counter,
    description: "Number of project keys queued for a fetch",
};

pub const FETCH_BATCH_SIZE: MetricDef = MetricDef {
    name: "project_cache.fetch.batch_size",
    metric_type: MetricType::Histogram,
    description: "Number of project keys resolved in a single batch",
};

pub const FETCH_RESULT: MetricDef = MetricDef {
    name: "project_cache.fetch.result",
    metric_type: MetricType::Counter,
    description: "Resolved project keys, tagged by source and result",
};

pub const UPSTREAM_REQUEST_DURATION: MetricDef = MetricDef {
    name: "upstream.request.duration",
    metric_type: MetricType::Histogram,
    description: "Time to complete an upstream query including retries in seconds",
};

pub const UPSTREAM_ATTEMPTS: MetricDef = MetricDef {
    name: "upstream.request.attempts",
    metric_type: MetricType::Histogram,
    description: "Number of attempts made for a single upstream query",
};

pub const UPSTREAM_FAILURES: MetricDef = MetricDef {
    name: "upstream.request.failures",
    metric_type: MetricType::Counter,
    description: "Number of upstream queries that failed, tagged by error kind",
};

pub const SHARED_CACHE_RESULT: MetricDef = MetricDef {
    name: "shared_cache.result",
    metric_type: MetricType::Counter,
    description: "Shared cache reads, tagged by hit, miss, or error",
};

pub const OVERRIDES_RELOAD: MetricDef = MetricDef {
    name: "overrides.reload",
    metric_type: MetricType::Counter,
    description: "Number of override directory scans",
};

pub const OVERRIDES_CHANGED: MetricDef = MetricDef {
    name: "overrides.changed",
    metric_type: MetricType::Counter,
    description: "Number of project configs changed by an override reload",
};

pub const GLOBAL_CONFIG_FETCH: MetricDef = MetricDef {
    name: "global_config.fetch",
    metric_type: MetricType::Counter,
    description: "Global config fetches, tagged by result",
};

pub const ADMISSION_REJECTED: MetricDef = MetricDef {
    name: "admission.rejected",
    metric_type: MetricType::Counter,
    description: "Number of rejected items, tagged by reason",
};

pub const ALL_METRICS: &[MetricDef] = &[
    CACHE_LOOKUP,
    CACHE_SIZE,
    CACHE_EVICTIONS,
    FETCH_SCHEDULED,
    FETCH_BATCH_SIZE,
    FETCH_RESULT,
    UPSTREAM_REQUEST_DURATION,
    UPSTREAM_ATTEMPTS,
    UPSTREAM_FAILURES,
    SHARED_CACHE_RESULT,
    OVERRIDES_RELOAD,
    OVERRIDES_CHANGED,
    GLOBAL_CONFIG_FETCH,
    ADMISSION_REJECTED,
];
