//! Pool limits and read-only statistics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Connection ceilings. Lowering a limit never closes existing connections;
/// it only stops new ones from being created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolLimits {
    pub total: usize,
    pub per_driver: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            total: 10,
            per_driver: 5,
        }
    }
}

impl PoolLimits {
    pub fn new(total: usize, per_driver: usize) -> Self {
        Self { total, per_driver }
    }

    /// A zero limit can never be satisfied, no matter how long a caller waits.
    pub fn is_hard_zero(&self) -> bool {
        self.total == 0 || self.per_driver == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    /// Connections currently leased out.
    pub active: usize,
    pub idle: usize,
    /// Slots reserved for connections still being opened.
    pub opening: usize,
}

impl DriverStats {
    pub fn total(&self) -> usize {
        self.active + self.idle + self.opening
    }
}

/// Snapshot of pool state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// All allocated slots, including connections still being opened.
    pub total: usize,
    pub limits: PoolLimits,
    pub drivers: BTreeMap<String, DriverStats>,
    pub waiting: usize,
}

impl PoolStats {
    pub fn driver(&self, name: &str) -> DriverStats {
        self.drivers.get(name).copied().unwrap_or_default()
    }
}
