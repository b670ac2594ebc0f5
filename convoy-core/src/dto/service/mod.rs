//! Service runtime DTOs

use serde::{Deserialize, Serialize};

use crate::domain::runtime::MetricDimension;

/// Utilization sample pushed to a runtime's autoscaling policy
///
/// The orchestrator stamps the sample with its own clock on arrival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveMetric {
    pub dimension: MetricDimension,
    pub utilization: f64,
}
