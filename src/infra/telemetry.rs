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
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "tagsweep_associations_upsert_failed_total",
            Unit::Count,
            "Fetches whose cache tag associations could not be recorded."
        );
        describe_counter!(
            "tagsweep_invalidation_identifiers_total",
            Unit::Count,
            "Query identifiers invalidated downstream and pruned."
        );
        describe_counter!(
            "tagsweep_downstream_invalidate_failed_total",
            Unit::Count,
            "Downstream invalidate calls that failed."
        );
        describe_counter!(
            "tagsweep_webhook_rejected_total",
            Unit::Count,
            "Inbound webhook requests rejected, labelled by reason."
        );
        describe_counter!(
            "tagsweep_upstream_fetch_total",
            Unit::Count,
            "Upstream content fetches, labelled by outcome."
        );
        describe_histogram!(
            "tagsweep_invalidation_ms",
            Unit::Milliseconds,
            "Latency of one invalidation batch in milliseconds."
        );
    });
}
