//! FTL metadata: lba→ppn table, per-block/per-plane/per-element state, BSN
//! counters, and the plane↔block address mapping (§3, §4.2).

use std::collections::VecDeque;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::bitmap::BlockBitmap;
use crate::dispatcher::SubRequest;
use crate::event::SimTime;
use crate::params::{Params, PlaneBlockMapping};
use crate::stats::ElementStats;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockState {
    Clean,
    InUse,
    Sealed,
}

/// A physical page address within an element: `block * pages_per_block + offset`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    pub fn new(block: u32, offset: u32, pages_per_block: u32) -> Self {
        PageId(block * pages_per_block + offset)
    }
    pub fn block(self, pages_per_block: u32) -> u32 {
        self.0 / pages_per_block
    }
    pub fn offset(self, pages_per_block: u32) -> u32 {
        self.0 % pages_per_block
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub plane: u32,
    pub rem_lifetime: u32,
    pub time_of_last_erasure: SimTime,
    pub state: BlockState,
    pub bsn: u64,
    /// One entry per page slot; `Some(lpn)` for a valid data page, `None`
    /// for empty/invalidated/summary slots.
    pub slots: Vec<Option<u64>>,
    pub num_valid: u32,
}

impl Block {
    fn new(plane: u32, pages_per_block: u32, max_erasures: u32) -> Self {
        Block {
            plane,
            rem_lifetime: max_erasures,
            time_of_last_erasure: SimTime::ZERO,
            state: BlockState::Clean,
            bsn: 0,
            slots: vec![None; pages_per_block as usize],
            num_valid: 0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Plane {
    pub blocks: Vec<u32>,
    pub active_page: Option<PageId>,
    pub free_blocks: u32,
    pub valid_pages: u32,
    pub cleaning: bool,
    pub clean_in_block: Option<u32>,
    pub block_alloc_cursor: usize,
    pub parunit: u32,
    pub cold_data_migration: bool,
}

/// A sub-request dequeued for the write path to act on.
pub struct WriteOutcome {
    pub cost: f64,
    pub ppn: PageId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Element {
    pub id: u32,
    pub cfg: Rc<Params>,
    pub blocks: Vec<Block>,
    pub planes: Vec<Plane>,
    pub lba_table: Vec<Option<PageId>>,
    pub free_bitmap: BlockBitmap,
    pub bsn_counter: u64,
    pub tot_free_blocks: u32,
    /// Allocation cursor used when copy-back is disabled and blocks are
    /// allocated from the whole element rather than a single plane.
    pub element_alloc_cursor: usize,
    #[serde(skip)]
    pub queue: VecDeque<SubRequest>,
    pub media_busy: bool,
    pub gang_num: Option<u32>,
    pub stats: ElementStats,
    /// Simple (non-OSR) write policy's per-plane cursor, used only when
    /// `write_policy == Simple`.
    pub simple_cursor: Vec<u32>,
}

fn pairwise_stripe_block_of(plane: u32, pos: u32, blocks_per_plane: u32) -> u32 {
    let pair_index = plane / 2;
    let within_pair = plane % 2;
    pair_index * (2 * blocks_per_plane) + pos * 2 + within_pair
}

/// `bitpos` is the canonical "plane-major, position-within-plane" address
/// used by the cleaner to scan one plane's blocks as a contiguous range,
/// independent of how block numbers are physically arranged.
pub fn block_to_bitpos(
    mapping: PlaneBlockMapping,
    block: u32,
    blocks_per_plane: u32,
    planes_per_pkg: u32,
) -> usize {
    let (plane, pos) = match mapping {
        PlaneBlockMapping::Concat => (block / blocks_per_plane, block % blocks_per_plane),
        PlaneBlockMapping::FullStripe => (block % planes_per_pkg, block / planes_per_pkg),
        PlaneBlockMapping::PairwiseStripe => {
            let pair_index = block / (2 * blocks_per_plane);
            let rem = block % (2 * blocks_per_plane);
            let within_pair = rem % 2;
            let pos = rem / 2;
            (pair_index * 2 + within_pair, pos)
        }
    };
    (plane * blocks_per_plane + pos) as usize
}

pub fn bitpos_to_block(
    mapping: PlaneBlockMapping,
    bitpos: usize,
    blocks_per_plane: u32,
    planes_per_pkg: u32,
) -> u32 {
    let plane = bitpos as u32 / blocks_per_plane;
    let pos = bitpos as u32 % blocks_per_plane;
    match mapping {
        PlaneBlockMapping::Concat => plane * blocks_per_plane + pos,
        PlaneBlockMapping::FullStripe => pos * planes_per_pkg + plane,
        PlaneBlockMapping::PairwiseStripe => pairwise_stripe_block_of(plane, pos, blocks_per_plane),
    }
}

impl Element {
    pub fn new(id: u32, cfg: Rc<Params>) -> Self {
        let blocks_per_element = cfg.blocks_per_element;
        let blocks_per_plane = cfg.blocks_per_plane;
        let planes_per_pkg = cfg.planes_per_package;
        let pages_per_block = cfg.pages_per_block;
        let data_pages_per_block = cfg.data_pages_per_block();
        let reserve = cfg.reserve_blocks_per_plane();
        let usable_per_plane = blocks_per_plane - reserve;

        let mut blocks = Vec::with_capacity(blocks_per_element as usize);
        for block_num in 0..blocks_per_element {
            let bitpos = block_to_bitpos(
                cfg.plane_block_mapping,
                block_num,
                blocks_per_plane,
                planes_per_pkg,
            );
            let plane = bitpos as u32 / blocks_per_plane;
            blocks.push(Block::new(plane, pages_per_block, u32::MAX));
        }

        let mut free_bitmap = BlockBitmap::new(blocks_per_element as usize);
        let mut planes = Vec::with_capacity(planes_per_pkg as usize);
        let mut plane_block_lists = Vec::with_capacity(planes_per_pkg as usize);
        for plane_idx in 0..planes_per_pkg {
            let mut plane_blocks = Vec::with_capacity(blocks_per_plane as usize);
            for pos in 0..blocks_per_plane {
                let bitpos = (plane_idx * blocks_per_plane + pos) as usize;
                let block = bitpos_to_block(
                    cfg.plane_block_mapping,
                    bitpos,
                    blocks_per_plane,
                    planes_per_pkg,
                );
                plane_blocks.push(block);
            }
            planes.push(Plane {
                blocks: plane_blocks.clone(),
                active_page: None,
                free_blocks: reserve,
                valid_pages: 0,
                cleaning: false,
                clean_in_block: None,
                block_alloc_cursor: 0,
                parunit: plane_idx % cfg.num_parallel_units,
                cold_data_migration: cfg.cold_data_migration,
            });
            plane_block_lists.push(plane_blocks);
        }

        let data_pages = cfg.data_pages_per_element();
        let mut lba_table = vec![None; data_pages as usize];
        let mut bsn_counter = 1u64;
        let mut next_lpn = 0u64;

        // Initial identity mapping (§4.2): every non-reserved ("data") block,
        // in plane-position order, is pre-filled contiguously with logical
        // pages, skipping the summary slot at the end of each block, and
        // sealed once full. Only the reserve section at the tail of each
        // plane stays CLEAN and contributes to `tot_free_blocks` (§8
        // property 3).
        for (plane_idx, plane_blocks) in plane_block_lists.iter().enumerate() {
            for &block_num in plane_blocks.iter().take(usable_per_plane as usize) {
                let bsn = bsn_counter;
                bsn_counter += 1;
                let block = &mut blocks[block_num as usize];
                block.state = BlockState::InUse;
                block.bsn = bsn;
                for offset in 0..data_pages_per_block {
                    let lpn = next_lpn;
                    next_lpn += 1;
                    block.slots[offset as usize] = Some(lpn);
                    lba_table[lpn as usize] = Some(PageId::new(block_num, offset, pages_per_block));
                }
                block.num_valid = data_pages_per_block;
                block.state = BlockState::Sealed;
                free_bitmap.set(block_num as usize);
                planes[plane_idx].valid_pages += data_pages_per_block;
            }
        }
        debug_assert_eq!(next_lpn, data_pages as u64);

        let tot_free_blocks = reserve * planes_per_pkg;

        Element {
            id,
            cfg,
            blocks,
            planes,
            lba_table,
            free_bitmap,
            bsn_counter,
            tot_free_blocks,
            element_alloc_cursor: 0,
            queue: VecDeque::new(),
            media_busy: false,
            gang_num: None,
            stats: ElementStats::default(),
            simple_cursor: vec![0; planes_per_pkg as usize],
        }
    }

    pub fn pages_per_block(&self) -> u32 {
        self.cfg.pages_per_block
    }

    /// Activate a CLEAN block: assign a fresh BSN (strictly monotonic, §8
    /// property 4), mark INUSE, and return its index.
    pub fn activate_block(&mut self, block_num: u32) -> u64 {
        let bsn = self.bsn_counter;
        self.bsn_counter += 1;
        let block = &mut self.blocks[block_num as usize];
        debug_assert_eq!(block.state, BlockState::Clean);
        block.state = BlockState::InUse;
        block.bsn = bsn;
        bsn
    }

    pub fn plane_of_block(&self, block_num: u32) -> u32 {
        self.blocks[block_num as usize].plane
    }
}

#[cfg(test)]
impl Element {
    /// Reset every block to CLEAN and every plane to fully free, as if the
    /// whole element were reserve space. Lets write-path/gang/dispatcher
    /// tests exercise allocation and sealing from a pristine device without
    /// depending on the reserve fraction populating the initial identity map.
    pub(crate) fn reset_to_blank(&mut self) {
        for block in &mut self.blocks {
            block.state = BlockState::Clean;
            block.bsn = 0;
            block.num_valid = 0;
            for slot in &mut block.slots {
                *slot = None;
            }
        }
        for entry in &mut self.lba_table {
            *entry = None;
        }
        self.free_bitmap = BlockBitmap::new(self.blocks.len());
        for plane in &mut self.planes {
            plane.free_blocks = plane.blocks.len() as u32;
            plane.valid_pages = 0;
            plane.active_page = None;
            plane.block_alloc_cursor = 0;
        }
        self.tot_free_blocks = self.blocks.len() as u32;
        self.bsn_counter = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::test_params;
    use proptest::prelude::*;

    proptest! {
        // Property 8: the plane<->block mapping round-trips for every
        // mapping kind, not just the fixed sizes exercised above.
        #[test]
        fn bitpos_block_round_trip_holds_for_arbitrary_sizes(
            b in 1u32..20,
            p in 1u32..8,
            raw_block in 0u32..160,
        ) {
            let block = raw_block % (b * p);
            for mapping in [
                PlaneBlockMapping::Concat,
                PlaneBlockMapping::FullStripe,
                PlaneBlockMapping::PairwiseStripe,
            ] {
                let pos = block_to_bitpos(mapping, block, b, p);
                prop_assert_eq!(bitpos_to_block(mapping, pos, b, p), block);
            }
        }
    }

    #[test]
    fn concat_mapping_is_identity() {
        let b = 8u32;
        let p = 4u32;
        for block in 0..(b * p) {
            let pos = block_to_bitpos(PlaneBlockMapping::Concat, block, b, p);
            assert_eq!(pos, block as usize);
            assert_eq!(bitpos_to_block(PlaneBlockMapping::Concat, pos, b, p), block);
        }
    }

    #[test]
    fn full_stripe_mapping_round_trips() {
        let b = 6u32;
        let p = 4u32;
        for block in 0..(b * p) {
            let pos = block_to_bitpos(PlaneBlockMapping::FullStripe, block, b, p);
            assert_eq!(bitpos_to_block(PlaneBlockMapping::FullStripe, pos, b, p), block);
            assert_eq!(block % p, pos as u32 / b);
        }
    }

    #[test]
    fn pairwise_stripe_mapping_round_trips() {
        let b = 6u32;
        let p = 4u32;
        for block in 0..(b * p) {
            let pos = block_to_bitpos(PlaneBlockMapping::PairwiseStripe, block, b, p);
            assert_eq!(
                bitpos_to_block(PlaneBlockMapping::PairwiseStripe, pos, b, p),
                block
            );
        }
    }

    #[test]
    fn bijective_for_every_bitpos_too() {
        let b = 5u32;
        let p = 3u32;
        for mapping in [
            PlaneBlockMapping::Concat,
            PlaneBlockMapping::FullStripe,
            PlaneBlockMapping::PairwiseStripe,
        ] {
            for bitpos in 0..(b * p) as usize {
                let block = bitpos_to_block(mapping, bitpos, b, p);
                assert_eq!(block_to_bitpos(mapping, block, b, p), bitpos);
            }
        }
    }

    #[test]
    fn element_init_reserves_blocks_and_counts_match() {
        let mut p = test_params();
        p.blocks_per_plane = 8;
        p.planes_per_package = 1;
        p.blocks_per_element = 8;
        p.reserve_pages_percent = 25;
        let data_pages_per_block = p.data_pages_per_block();
        let data_pages = p.data_pages_per_element();
        let elem = Element::new(0, Rc::new(p));
        assert_eq!(elem.tot_free_blocks, 2);
        assert_eq!(elem.free_bitmap.count_clear(), 2);
        assert_eq!(elem.planes[0].free_blocks, 2);

        // Every non-reserved block is pre-filled with the identity map and
        // sealed; only the last two (reserve) blocks stay CLEAN.
        for block_num in 0..6u32 {
            assert_eq!(elem.blocks[block_num as usize].state, BlockState::Sealed);
            assert_eq!(elem.blocks[block_num as usize].num_valid, data_pages_per_block);
        }
        for block_num in 6..8u32 {
            assert_eq!(elem.blocks[block_num as usize].state, BlockState::Clean);
        }
        assert_eq!(elem.lba_table.len(), data_pages as usize);
        assert!(elem.lba_table.iter().all(|p| p.is_some()));
    }

    #[test]
    fn bsn_is_strictly_monotonic_on_activation() {
        let p = test_params();
        let mut elem = Element::new(0, Rc::new(p));
        // Blocks 6 and 7 are the reserve section (25% of 8) and start CLEAN.
        let a = elem.activate_block(6);
        elem.blocks[6].state = BlockState::Clean;
        let b = elem.activate_block(7);
        assert!(b > a);
    }
}
