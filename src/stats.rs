//! Per-element/per-device counters. The core only accumulates these;
//! formatting and aggregation across devices is an external concern (§1).

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ElementStats {
    pub num_clean: u64,
    pub pages_moved: u64,
    pub tot_xfer_cost: f64,
    pub tot_reqs_issued: u64,
    pub tot_time_taken: f64,
    pub tot_clean_time: f64,
    pub tot_migrations: u64,
    pub tot_pages_migrated: u64,
    pub mig_cost: f64,
}

impl ElementStats {
    pub fn avg_access_time(&self) -> f64 {
        if self.tot_reqs_issued == 0 {
            0.0
        } else {
            self.tot_time_taken / self.tot_reqs_issued as f64
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceStats {
    pub requests_completed: u64,
    pub requests_waiting_bus: u64,
    pub tot_bus_wait_time: f64,
    pub num_bus_waits: u64,
}
