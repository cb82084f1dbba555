//! Hooks for the permission and telemetry systems that sit outside the
//! engine. Both default to no-ops.

use crate::errors::Operation;
use crate::models::object::DataClassification;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Decides whether an operation on a key may proceed.
pub trait PermissionChecker: Send + Sync {
    fn check(&self, key: &str, classification: DataClassification, operation: Operation) -> bool;
}

/// Permits everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl PermissionChecker for AllowAll {
    fn check(&self, _key: &str, _classification: DataClassification, _operation: Operation) -> bool {
        true
    }
}

impl<F> PermissionChecker for F
where
    F: Fn(&str, DataClassification, Operation) -> bool + Send + Sync,
{
    fn check(&self, key: &str, classification: DataClassification, operation: Operation) -> bool {
        self(key, classification, operation)
    }
}

pub type Attributes = BTreeMap<String, String>;

/// Sink for named events and numeric metrics.
pub trait TelemetrySink: Send + Sync {
    fn record_event(&self, name: &str, attributes: &Attributes);
    fn record_metric(&self, name: &str, value: f64, attributes: &Attributes);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn record_event(&self, _name: &str, _attributes: &Attributes) {}
    fn record_metric(&self, _name: &str, _value: f64, _attributes: &Attributes) {}
}

/// Forwards telemetry into the `tracing` pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record_event(&self, name: &str, attributes: &Attributes) {
        info!(target: "dist_storage::telemetry", event = name, ?attributes);
    }

    fn record_metric(&self, name: &str, value: f64, attributes: &Attributes) {
        debug!(target: "dist_storage::telemetry", metric = name, value, ?attributes);
    }
}

/// Build an attribute map from string pairs.
pub fn attrs<const N: usize>(pairs: [(&str, String); N]) -> Attributes {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}
