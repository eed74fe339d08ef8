//! Health reporting types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Derived component status
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Fresh and succeeding
    Healthy,
    /// Operating but missing freshness or success targets
    Degraded,
    /// No successful activity for the down threshold
    Down,
}

impl ComponentStatus {
    /// Worst of a set of statuses; healthy when empty
    #[must_use]
    pub fn worst<I: IntoIterator<Item = Self>>(statuses: I) -> Self {
        statuses.into_iter().max().unwrap_or(Self::Healthy)
    }
}

/// Point-in-time health of one component
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Component name
    pub component: String,
    /// Derived status
    pub status: ComponentStatus,
    /// Last successful operation
    pub last_success: Option<DateTime<Utc>>,
    /// Failures since the last success
    pub consecutive_failures: u64,
    /// Free-form counters
    pub counters: BTreeMap<String, u64>,
    /// When this snapshot was computed
    pub sampled_at: DateTime<Utc>,
}
