//! Typed, validated target for the external parameter-file loader (§6). The
//! line-oriented text format parser itself is an external collaborator; this
//! module owns every key in the SSD module's key table plus the
//! cross-field validation the loader is expected to run after populating a
//! `Params`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimingModel {
    Simple,
    SimpleDw,
    LogDisk,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WritePolicy {
    Simple,
    Osr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleaningPolicy {
    Random,
    GreedyWearAgnostic,
    GreedyWearAware,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlaneBlockMapping {
    Concat,
    PairwiseStripe,
    FullStripe,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CopyBack {
    Disable,
    Enable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GangShare {
    SharedBus,
    SharedControl,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocPoolLogic {
    Gang,
    Chip,
    Plane,
}

/// Which rate-limiting formula `GreedyWearAware` uses. `ssd_clean.c` ships
/// both behind a `CAMERA_READY` compile-time flag; we expose both and pick
/// the shipped (non-camera-ready) default, see DESIGN.md.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateLimitModel {
    Simple,
    Windowed,
}

/// The I/O queue's admission/ordering policy. The queue discipline itself
/// (which request to run next) is a thin scheduling concern layered on top
/// of the per-element `VecDeque`; FIFO is the only policy the core ships.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scheduler {
    Fifo,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub scheduler: Scheduler,
    pub max_queue_length: u32,
    pub block_count: u32,
    pub bus_transaction_latency: f64,
    pub bulk_sector_transfer_time: f64,
    pub never_disconnect: bool,
    pub print_stats: bool,
    pub command_overhead: f64,
    pub timing_model: TimingModel,

    pub flash_chip_elements: u32,
    pub page_size_sectors: u32,
    pub pages_per_block: u32,
    pub blocks_per_element: u32,
    pub element_stride_pages: u32,
    pub chip_xfer_latency: f64,
    pub page_read_latency: f64,
    pub page_write_latency: f64,
    pub block_erase_latency: f64,

    pub write_policy: WritePolicy,
    pub reserve_pages_percent: u32,
    pub min_free_blocks_percent: u32,
    pub cleaning_policy: CleaningPolicy,
    pub rate_limit_model: RateLimitModel,

    pub planes_per_package: u32,
    pub blocks_per_plane: u32,
    pub plane_block_mapping: PlaneBlockMapping,
    pub copy_back: CopyBack,
    pub num_parallel_units: u32,
    pub elements_per_gang: u32,
    pub cleaning_in_background: bool,
    pub gang_share: GangShare,
    pub alloc_pool_logic: AllocPoolLogic,

    pub cold_data_migration: bool,
}

pub const MAX_RESERVE_PERCENT: u32 = 50;
pub const WEAR_AWARE_THRESHOLD_X: f64 = 0.80;
pub const WEAR_AWARE_WINDOW: f64 = 0.80;
pub const COLD_MIGRATION_THRESHOLD_Y: f64 = 0.85;
pub const MAX_REQS_ELEM_QUEUE: usize = 100;
pub const DATA_BYTES_PER_SECTOR: u32 = 512;
pub const META_BYTES_PER_SECTOR: u32 = 16;
pub const BYTES_PER_SECTOR: u32 = DATA_BYTES_PER_SECTOR + META_BYTES_PER_SECTOR;
pub const SECTORS_PER_SUMMARY_PAGE: u32 = 1;

impl Params {
    /// Bytes per page, including per-sector metadata bytes.
    pub fn page_bytes(&self) -> u32 {
        self.page_size_sectors * BYTES_PER_SECTOR
    }

    /// Data pages per block (every block's last page is the summary page).
    pub fn data_pages_per_block(&self) -> u32 {
        self.pages_per_block - 1
    }

    pub fn low_watermark_blocks(&self) -> u32 {
        self.blocks_per_element * self.min_free_blocks_percent / 100
    }

    /// High watermark defaults to low + 1 (§4.4).
    pub fn high_watermark_blocks(&self) -> u32 {
        self.low_watermark_blocks() + 1
    }

    pub fn reserve_blocks_per_plane(&self) -> u32 {
        self.blocks_per_plane * self.reserve_pages_percent / 100
    }

    pub fn cost_of_page_transfer(&self) -> f64 {
        self.chip_xfer_latency * self.page_bytes() as f64
    }

    pub fn cost_of_sector_transfer(&self, sectors: u32) -> f64 {
        self.chip_xfer_latency * (sectors * BYTES_PER_SECTOR) as f64
    }

    /// Validate every constraint named in §6's parameter-file key table,
    /// returning the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.block_count == 0 {
            return Err(SimError::config(
                "Block count",
                self.block_count,
                "must be >= 1",
            ));
        }
        if self.bus_transaction_latency < 0.0 {
            return Err(SimError::config(
                "Bus transaction latency",
                self.bus_transaction_latency,
                "must be >= 0",
            ));
        }
        if self.bulk_sector_transfer_time < 0.0 {
            return Err(SimError::config(
                "Bulk sector transfer time",
                self.bulk_sector_transfer_time,
                "must be >= 0",
            ));
        }
        if self.command_overhead < 0.0 {
            return Err(SimError::config(
                "Command overhead",
                self.command_overhead,
                "must be >= 0",
            ));
        }
        if !(1..=64).contains(&self.flash_chip_elements) {
            return Err(SimError::config(
                "Flash chip elements",
                self.flash_chip_elements,
                "must be in 1..=64",
            ));
        }
        if self.page_size_sectors < 8 {
            return Err(SimError::config(
                "Page size",
                self.page_size_sectors,
                "must be >= 8 sectors",
            ));
        }
        if self.pages_per_block == 0 {
            return Err(SimError::config(
                "Pages per block",
                self.pages_per_block,
                "must be > 0",
            ));
        }
        if self.blocks_per_element == 0 {
            return Err(SimError::config(
                "Blocks per element",
                self.blocks_per_element,
                "must be > 0",
            ));
        }
        if self.blocks_per_element != self.planes_per_package * self.blocks_per_plane {
            return Err(SimError::config(
                "Blocks per element",
                self.blocks_per_element,
                "must equal planes_per_pkg * blocks_per_plane",
            ));
        }
        if self.element_stride_pages < 8 {
            return Err(SimError::config(
                "Element stride pages",
                self.element_stride_pages,
                "must be >= 8",
            ));
        }
        if self.chip_xfer_latency < 0.0
            || self.page_read_latency < 0.0
            || self.page_write_latency < 0.0
            || self.block_erase_latency < 0.0
        {
            return Err(SimError::config(
                "Chip/page/erase latency",
                (
                    self.chip_xfer_latency,
                    self.page_read_latency,
                    self.page_write_latency,
                    self.block_erase_latency,
                ),
                "must all be >= 0",
            ));
        }
        if self.reserve_pages_percent > MAX_RESERVE_PERCENT {
            return Err(SimError::config(
                "Reserve pages percentage",
                self.reserve_pages_percent,
                "must be 0..=50",
            ));
        }
        if self.min_free_blocks_percent >= self.reserve_pages_percent {
            return Err(SimError::config(
                "Minimum free blocks percentage",
                self.min_free_blocks_percent,
                "must be < reserve percentage",
            ));
        }
        if !(1..=16).contains(&self.planes_per_package) {
            return Err(SimError::config(
                "Planes per package",
                self.planes_per_package,
                "must be in 1..=16",
            ));
        }
        if self.blocks_per_plane == 0 {
            return Err(SimError::config(
                "Blocks per plane",
                self.blocks_per_plane,
                "must be > 0",
            ));
        }
        if self.num_parallel_units == 0 || self.planes_per_package % self.num_parallel_units != 0 {
            return Err(SimError::config(
                "Number of parallel units",
                self.num_parallel_units,
                "must divide planes per package",
            ));
        }
        if self.elements_per_gang == 0 || self.flash_chip_elements % self.elements_per_gang != 0 {
            return Err(SimError::config(
                "Elements per gang",
                self.elements_per_gang,
                "must divide flash chip elements",
            ));
        }
        if self.alloc_pool_logic == AllocPoolLogic::Plane && self.copy_back == CopyBack::Disable {
            return Err(SimError::config(
                "Allocation pool logic",
                "Plane",
                "requires copy-back enabled",
            ));
        }
        Ok(())
    }

    pub fn data_pages_per_element(&self) -> u32 {
        let reserve = self.reserve_blocks_per_plane() * self.planes_per_package;
        (self.blocks_per_element - reserve) * self.data_pages_per_block()
    }

    /// Total addressable device size in sectors, across every element (§4.7
    /// fatal check: a request's `blkno + bcount` must not exceed this).
    pub fn device_size_sectors(&self) -> u64 {
        self.flash_chip_elements as u64
            * self.data_pages_per_element() as u64
            * self.page_size_sectors as u64
    }
}

#[cfg(test)]
pub fn test_params() -> Params {
    Params {
        scheduler: Scheduler::Fifo,
        max_queue_length: 32,
        block_count: 1,
        bus_transaction_latency: 0.0,
        bulk_sector_transfer_time: 0.0,
        never_disconnect: false,
        print_stats: false,
        command_overhead: 0.0,
        timing_model: TimingModel::Simple,
        flash_chip_elements: 1,
        page_size_sectors: 8,
        pages_per_block: 64,
        blocks_per_element: 8,
        element_stride_pages: 8,
        chip_xfer_latency: 2.5e-5,
        page_read_latency: 0.025,
        page_write_latency: 0.2,
        block_erase_latency: 1.5,
        write_policy: WritePolicy::Osr,
        reserve_pages_percent: 25,
        min_free_blocks_percent: 12,
        cleaning_policy: CleaningPolicy::GreedyWearAgnostic,
        rate_limit_model: RateLimitModel::Simple,
        planes_per_package: 1,
        blocks_per_plane: 8,
        plane_block_mapping: PlaneBlockMapping::Concat,
        copy_back: CopyBack::Disable,
        num_parallel_units: 1,
        elements_per_gang: 1,
        cleaning_in_background: false,
        gang_share: GangShare::SharedControl,
        alloc_pool_logic: AllocPoolLogic::Chip,
        cold_data_migration: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_params_pass() {
        assert!(test_params().validate().is_ok());
    }

    #[test]
    fn mismatched_blocks_per_element_rejected() {
        let mut p = test_params();
        p.blocks_per_element = 9;
        assert!(p.validate().is_err());
    }

    #[test]
    fn min_free_must_be_below_reserve() {
        let mut p = test_params();
        p.min_free_blocks_percent = p.reserve_pages_percent;
        assert!(p.validate().is_err());
    }

    #[test]
    fn plane_pool_without_copyback_rejected() {
        let mut p = test_params();
        p.alloc_pool_logic = AllocPoolLogic::Plane;
        p.copy_back = CopyBack::Disable;
        assert!(p.validate().is_err());
    }

    #[test]
    fn plane_pool_with_copyback_accepted() {
        let mut p = test_params();
        p.alloc_pool_logic = AllocPoolLogic::Plane;
        p.copy_back = CopyBack::Enable;
        assert!(p.validate().is_ok());
    }
}
