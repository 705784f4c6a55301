use std::time::Instant;

use chrono::{DateTime, Utc};
use kube::runtime::events::Reporter;
use kube::ResourceExt;
use prometheus::{histogram_opts, opts, Histogram, IntCounter, IntCounterVec, Registry};
use serde::Serialize;

use crate::api::machine::Machine;
use crate::Error;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: Histogram,
    pub operations: IntCounterVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = Histogram::with_opts(histogram_opts!(
            "machine_controller_reconcile_duration_seconds",
            "The duration of reconcile to complete in seconds",
            vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60., 300., 900.]
        ))
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "machine_controller_reconciliation_errors_total",
                "reconciliation errors"
            ),
            &["instance", "error"],
        )
        .unwrap();
        let reconciliations = IntCounter::new(
            "machine_controller_reconciliations_total",
            "reconciliations",
        )
        .unwrap();
        let operations = IntCounterVec::new(
            opts!(
                "machine_actuator_operations_total",
                "actuator operations started"
            ),
            &["operation"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            operations,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.operations.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, machine: &Machine, e: &Error) {
        self.failures
            .with_label_values(&[machine.name_any().as_ref(), e.metric_label().as_ref()])
            .inc()
    }

    pub fn operation(&self, operation: &str) {
        self.operations.with_label_values(&[operation]).inc()
    }

    pub fn count_and_measure(&self) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metric.observe(duration);
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "linode-machine-controller".into(),
        }
    }
}
