use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
/// `RUST_LOG` directives take precedence over the configured level.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| InfraError::telemetry(format!("failed to install tracing subscriber: {err}")))
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "relay_cache_hit_total",
            Unit::Count,
            "Persistent cache lookups served from disk."
        );
        describe_counter!(
            "relay_cache_miss_total",
            Unit::Count,
            "Persistent cache lookups that fell through to a fetch."
        );
        describe_counter!(
            "relay_cache_write_total",
            Unit::Count,
            "Entries written to the persistent cache."
        );
        describe_counter!(
            "relay_cache_fault_total",
            Unit::Count,
            "Storage faults absorbed by the persistent cache."
        );
        describe_counter!(
            "relay_discovery_hit_total",
            Unit::Count,
            "Discovery lookups served from memory."
        );
        describe_counter!(
            "relay_discovery_miss_total",
            Unit::Count,
            "Discovery lookups that were absent or expired."
        );
        describe_counter!(
            "relay_discovery_evict_total",
            Unit::Count,
            "Discovery entries evicted due to capacity."
        );
        describe_counter!(
            "relay_fanout_target_total",
            Unit::Count,
            "Per-target fan-out outcomes by status."
        );
        describe_histogram!(
            "relay_fanout_ms",
            Unit::Milliseconds,
            "Wall time of one fan-out in milliseconds."
        );
    });
}
