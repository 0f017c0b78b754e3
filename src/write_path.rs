//! Out-of-place write path (§4.3) plus the legacy simple (non-OSR) policy.

use crate::error::{Result, SimError};
use crate::event::SimTime;
use crate::ftl::{BlockState, Element, PageId};
use crate::params::Params;

/// Scope for active-page bookkeeping: a specific plane (copy-back enabled,
/// one active page per plane) or the whole element (copy-back disabled,
/// one global active page, §4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActiveScope {
    Plane(usize),
    Element,
}

fn active_page_of(elem: &Element, scope: ActiveScope) -> Option<PageId> {
    match scope {
        ActiveScope::Plane(p) => elem.planes[p].active_page,
        ActiveScope::Element => elem.planes.iter().find_map(|p| p.active_page),
    }
}

fn set_active_page(elem: &mut Element, scope: ActiveScope, page: PageId) {
    match scope {
        ActiveScope::Plane(p) => elem.planes[p].active_page = Some(page),
        ActiveScope::Element => {
            // Copy-back disabled: there is conceptually one element-wide
            // active page; mirror it on plane 0 so plane-indexed bookkeeping
            // (free_blocks, valid_pages) stays meaningful.
            elem.planes[0].active_page = Some(page);
        }
    }
}

/// Find a CLEAN block and activate it, scoped to `scope`. Scans the shared
/// free-block bitmap starting at the relevant allocation cursor, wrapping.
pub fn alloc_active_block(elem: &mut Element, scope: ActiveScope, _now: SimTime) -> Result<PageId> {
    let pages_per_block = elem.pages_per_block();
    let block_list: Vec<u32> = match scope {
        ActiveScope::Plane(p) => elem.planes[p].blocks.clone(),
        ActiveScope::Element => (0..elem.blocks.len() as u32).collect(),
    };
    let cursor = match scope {
        ActiveScope::Plane(p) => elem.planes[p].block_alloc_cursor,
        ActiveScope::Element => elem.element_alloc_cursor,
    };

    let found = block_list
        .iter()
        .enumerate()
        .cycle()
        .skip(cursor)
        .take(block_list.len())
        .find(|(_, &block_num)| elem.free_bitmap.is_clear(block_num as usize))
        .map(|(i, &block_num)| (i, block_num));

    let (found_idx, block_num) = found.ok_or_else(|| {
        SimError::exhausted(format!(
            "no free block available for scope {scope:?} on element {}",
            elem.id
        ))
    })?;

    elem.free_bitmap.set(block_num as usize);
    elem.tot_free_blocks -= 1;
    let plane_of_block = elem.blocks[block_num as usize].plane as usize;
    elem.planes[plane_of_block].free_blocks -= 1;
    let next_cursor = (found_idx + 1) % block_list.len().max(1);
    match scope {
        ActiveScope::Plane(p) => elem.planes[p].block_alloc_cursor = next_cursor,
        ActiveScope::Element => elem.element_alloc_cursor = next_cursor,
    }

    elem.activate_block(block_num);

    Ok(PageId::new(block_num, 0, pages_per_block))
}

fn seal_block(elem: &mut Element, block_num: u32, cfg: &Params) -> f64 {
    elem.blocks[block_num as usize].state = BlockState::Sealed;
    cfg.page_write_latency + cfg.cost_of_sector_transfer(crate::params::SECTORS_PER_SUMMARY_PAGE)
}

fn assert_version_order(elem: &Element, prev: PageId, next: PageId, pages_per_block: u32) -> Result<()> {
    let prev_block = prev.block(pages_per_block);
    let next_block = next.block(pages_per_block);
    if prev_block == next_block {
        if prev.offset(pages_per_block) >= next.offset(pages_per_block) {
            return Err(SimError::invariant(format!(
                "version order violated within block {next_block}: prev offset {} >= next offset {}",
                prev.offset(pages_per_block),
                next.offset(pages_per_block)
            )));
        }
    } else {
        let prev_bsn = elem.blocks[prev_block as usize].bsn;
        let next_bsn = elem.blocks[next_block as usize].bsn;
        if !(prev_bsn < next_bsn) {
            return Err(SimError::invariant(format!(
                "version order violated: prev block {prev_block} bsn {prev_bsn} >= next block {next_block} bsn {next_bsn}"
            )));
        }
    }
    Ok(())
}

/// Install logical page `lpn` at the next active page for `scope`, exactly
/// the 5-step algorithm in §4.3. Returns the accumulated cost and the
/// physical page written.
pub fn write_page(
    elem: &mut Element,
    cfg: &Params,
    scope: ActiveScope,
    lpn: u64,
    sectors: u32,
    now: SimTime,
) -> Result<(f64, PageId)> {
    let pages_per_block = cfg.pages_per_block;
    let mut cost = 0.0;

    let mut ap = active_page_of(elem, scope);
    let needs_new_block = match ap {
        None => true,
        Some(p) => p.offset(pages_per_block) >= cfg.data_pages_per_block(),
    };
    if needs_new_block {
        if let Some(prev_ap) = ap {
            cost += seal_block(elem, prev_ap.block(pages_per_block), cfg);
        }
        let new_ap = alloc_active_block(elem, scope, now)?;
        set_active_page(elem, scope, new_ap);
        ap = Some(new_ap);
    }
    let ap = ap.expect("active page established above");

    if let Some(prev_ppn) = elem.lba_table[lpn as usize] {
        assert_version_order(elem, prev_ppn, ap, pages_per_block)?;
        let prev_block = prev_ppn.block(pages_per_block);
        let prev_offset = prev_ppn.offset(pages_per_block);
        elem.blocks[prev_block as usize].slots[prev_offset as usize] = None;
        elem.blocks[prev_block as usize].num_valid -= 1;
        let prev_plane = elem.blocks[prev_block as usize].plane as usize;
        elem.planes[prev_plane].valid_pages -= 1;
    }

    let block_num = ap.block(pages_per_block);
    let offset = ap.offset(pages_per_block);
    elem.blocks[block_num as usize].slots[offset as usize] = Some(lpn);
    elem.blocks[block_num as usize].num_valid += 1;
    let plane = elem.blocks[block_num as usize].plane as usize;
    elem.planes[plane].valid_pages += 1;
    elem.lba_table[lpn as usize] = Some(ap);

    let next_ap = PageId::new(block_num, offset + 1, pages_per_block);
    set_active_page(elem, scope, next_ap);

    cost += cfg.page_write_latency + cfg.cost_of_sector_transfer(sectors);

    Ok((cost, ap))
}

/// Legacy stride-based write policy: a fixed position within a block
/// derived from the logical page number, with a simulated erase +
/// copy-forward charge on rollover. Does not consult the lba table.
pub fn simple_write(elem: &mut Element, cfg: &Params, plane_idx: usize, lpn: u64, sectors: u32) -> (f64, PageId) {
    let data_pages_per_block = cfg.data_pages_per_block();
    let block = (lpn / data_pages_per_block as u64) as u32;
    let offset = (lpn % data_pages_per_block as u64) as u32;
    let cursor = elem.simple_cursor[plane_idx];

    let mut cost = 0.0;
    if offset < cursor {
        cost += cfg.block_erase_latency + cursor as f64 * cfg.page_write_latency;
        elem.simple_cursor[plane_idx] = 0;
    }
    cost += cfg.page_write_latency + cfg.cost_of_sector_transfer(sectors);
    elem.simple_cursor[plane_idx] = offset + 1;

    (cost, PageId::new(block, offset, cfg.pages_per_block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::test_params;
    use proptest::prelude::*;
    use std::rc::Rc;

    proptest! {
        // Properties 2, 3, 5: after an arbitrary sequence of writes (with
        // heavy rewrite/invalidation pressure from a small lpn universe),
        // per-block valid-page counts and free-block accounting both stay
        // internally consistent, and every write succeeds without tripping
        // the version-order assertion baked into `write_page`.
        #[test]
        fn write_sequence_preserves_valid_page_and_free_block_accounting(
            lpns in prop::collection::vec(0u64..8, 1..40),
        ) {
            let mut cfg = test_params();
            cfg.blocks_per_element = 64;
            cfg.blocks_per_plane = 64;
            cfg.pages_per_block = 8;
            cfg.planes_per_package = 1;
            cfg.reserve_pages_percent = 0;
            cfg.min_free_blocks_percent = 0;
            let mut elem = Element::new(0, Rc::new(cfg.clone()));
            elem.reset_to_blank();

            for lpn in lpns {
                write_page(&mut elem, &cfg, ActiveScope::Plane(0), lpn, 8, SimTime::ZERO).unwrap();
            }

            for block in &elem.blocks {
                let actual_valid = block.slots.iter().filter(|s| s.is_some()).count() as u32;
                prop_assert_eq!(block.num_valid, actual_valid);
            }

            let free_from_bitmap = elem.free_bitmap.count_clear() as u32;
            prop_assert_eq!(elem.tot_free_blocks, free_from_bitmap);
            let free_from_planes: u32 = elem.planes.iter().map(|p| p.free_blocks).sum();
            prop_assert_eq!(elem.tot_free_blocks, free_from_planes);
        }
    }

    #[test]
    fn s1_single_read_timing_matches_scenario() {
        // S1: not a write path test, but confirms the cost model used below.
        let cfg = test_params();
        let cost = cfg.page_read_latency + cfg.cost_of_sector_transfer(8);
        assert!((cost - 0.1306).abs() < 1e-4);
    }

    #[test]
    fn s2_write_with_rollover_costs_match_scenario() {
        let mut cfg = test_params();
        cfg.blocks_per_element = 2;
        cfg.blocks_per_plane = 2;
        cfg.pages_per_block = 4;
        cfg.planes_per_package = 1;
        cfg.reserve_pages_percent = 0;
        cfg.min_free_blocks_percent = 0;
        let mut elem = Element::new(0, Rc::new(cfg.clone()));
        elem.reset_to_blank();
        let per_write = cfg.page_write_latency + cfg.cost_of_sector_transfer(8);
        let summary_cost = cfg.page_write_latency + cfg.cost_of_sector_transfer(1);

        // pages_per_block=4 => 3 data slots per block. Writes to lpn 0,1,2
        // fill the first block's data slots at plain per-write cost each.
        for lpn in 0..3u64 {
            let (cost, _) = write_page(&mut elem, &cfg, ActiveScope::Plane(0), lpn, 8, SimTime::ZERO).unwrap();
            assert!((cost - per_write).abs() < 1e-9, "lpn {lpn} cost mismatch");
        }

        // The 4th write (lpn=3) finds active_page past the last data slot:
        // it seals the first block (summary cost) and allocates+writes into
        // a fresh second block in the same operation (§4.3 steps 1 and 5).
        let (cost4, ppn4) = write_page(&mut elem, &cfg, ActiveScope::Plane(0), 3, 8, SimTime::ZERO).unwrap();
        assert!((cost4 - (summary_cost + per_write)).abs() < 1e-9);
        assert_eq!(elem.blocks[ppn4.block(4) as usize].bsn, 2);
        assert_eq!(elem.tot_free_blocks, 0);

        // The 5th write (lpn=4) continues into the already-active second
        // block at plain per-write cost; no further allocation.
        let (cost5, ppn5) = write_page(&mut elem, &cfg, ActiveScope::Plane(0), 4, 8, SimTime::ZERO).unwrap();
        assert!((cost5 - per_write).abs() < 1e-9);
        assert_eq!(ppn5.block(4), ppn4.block(4));
    }

    #[test]
    fn rewrite_invalidates_previous_slot_and_keeps_version_order() {
        let mut cfg = test_params();
        cfg.blocks_per_element = 4;
        cfg.blocks_per_plane = 4;
        cfg.pages_per_block = 8;
        cfg.planes_per_package = 1;
        cfg.reserve_pages_percent = 0;
        cfg.min_free_blocks_percent = 0;
        let mut elem = Element::new(0, Rc::new(cfg.clone()));
        elem.reset_to_blank();

        let (_, first) = write_page(&mut elem, &cfg, ActiveScope::Plane(0), 0, 8, SimTime::ZERO).unwrap();
        assert_eq!(elem.blocks[first.block(8) as usize].num_valid, 1);

        // Fill the rest of the block's data slots, then write lpn 0 again.
        for lpn in 1..7u64 {
            write_page(&mut elem, &cfg, ActiveScope::Plane(0), lpn, 8, SimTime::ZERO).unwrap();
        }
        let (_, second) = write_page(&mut elem, &cfg, ActiveScope::Plane(0), 0, 8, SimTime::ZERO).unwrap();
        assert_ne!(first, second);
        assert_eq!(elem.blocks[first.block(8) as usize].num_valid, 6);
        assert_eq!(elem.lba_table[0], Some(second));
    }
}
