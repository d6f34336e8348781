/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use std::sync::atomic::Ordering;

use log::{trace, warn};
use try_lock::TryLock;

use crate::modules::backing_store::BackingStoreModule;
use crate::modules::page_backend::PageBackendModule;
use crate::vlm_core::{debug_enabled, CoreShared};

/// Serializes eviction passes: whoever holds the gate reclaims for
/// everyone, the others go on installing and overshoot by at most their
/// in-flight group.
pub(crate) struct EvictionEngine {
    gate: TryLock<()>,
}

/// A victim is referenced by key, never by pointer; it is looked up and
/// re-validated under the descriptor lock right before it is flushed.
#[derive(Debug, Clone, Copy)]
struct Victim {
    epoch: u64,
    base_addr: usize,
    group: usize,
}

impl EvictionEngine {
    pub(crate) fn new() -> Self {
        EvictionEngine {
            gate: TryLock::new(()),
        }
    }
}

/// Ensures `incoming_pages` can be installed within the global budget,
/// evicting approximately-least-recently-touched groups first. Called with
/// no descriptor lock held. With `incoming_pages == 0` this is the
/// periodic-tick budget sweep.
pub(crate) fn make_room<B: PageBackendModule, S: BackingStoreModule>(
    core: &CoreShared<B, S>,
    incoming_pages: usize,
) {
    if fits(core, incoming_pages) {
        return;
    }

    let Some(_gate) = core.evictor.gate.try_lock() else {
        // an eviction pass is already running on another worker
        return;
    };

    let victims = collect_victims(core);
    let mut freed = 0usize;
    for victim in &victims {
        if fits(core, incoming_pages) {
            break;
        }
        freed += evict_group(core, victim);
    }

    if !fits(core, incoming_pages) && debug_enabled() {
        trace!(
            "budget still exceeded after eviction pass ({} pages freed, {} candidates)",
            freed,
            victims.len()
        );
    }
}

fn fits<B: PageBackendModule, S: BackingStoreModule>(
    core: &CoreShared<B, S>,
    incoming_pages: usize,
) -> bool {
    core.resident_pages.load(Ordering::SeqCst) + incoming_pages <= core.budget_pages
}

/// Scans every object for whole resident groups, oldest epochs first.
/// Descriptors busy installing are skipped this pass.
fn collect_victims<B: PageBackendModule, S: BackingStoreModule>(
    core: &CoreShared<B, S>,
) -> Vec<Victim> {
    let mut victims = Vec::new();

    for descriptor in core.registry.snapshot() {
        let geometry = &descriptor.geometry;
        let Ok(state) = descriptor.state.try_lock() else {
            continue;
        };
        if state.terminating {
            continue;
        }

        for group in 0..geometry.n_groups {
            // header groups hold host-written bytes no populate call can
            // bring back
            if geometry.group_contains_header(group) {
                continue;
            }
            let (page_lo, page_hi) = geometry.group_pages(group);
            if !state.residency.all_set(page_lo, page_hi) {
                continue;
            }
            victims.push(Victim {
                epoch: state.group_epoch[group],
                base_addr: geometry.base_addr,
                group,
            });
        }
    }

    victims.sort_unstable_by_key(|victim| victim.epoch);
    victims
}

/// Flushes and punches out one victim group. Returns the number of pages
/// freed (0 when the group was skipped or the flush failed).
fn evict_group<B: PageBackendModule, S: BackingStoreModule>(
    core: &CoreShared<B, S>,
    victim: &Victim,
) -> usize {
    // the object may have died since selection
    let Some(descriptor) = core.registry.get(victim.base_addr) else {
        return 0;
    };
    let geometry = &descriptor.geometry;
    let Ok(mut state) = descriptor.state.try_lock() else {
        return 0;
    };
    if state.terminating {
        return 0;
    }

    let (page_lo, page_hi) = geometry.group_pages(victim.group);
    if !state.residency.all_set(page_lo, page_hi) {
        return 0;
    }

    // flush dirty pages before the content disappears
    for page in page_lo..page_hi {
        if !state.dirty.is_set(page) {
            continue;
        }

        let page_addr = geometry.base_addr + page * geometry.page_size;
        let bytes =
            unsafe { std::slice::from_raw_parts(page_addr as *const u8, geometry.page_size) };
        let backing = state.backing.as_mut().expect("live object without backing");
        if let Err(err) = backing.write_page(page, bytes) {
            // abort this group, pages stay resident; other groups proceed
            warn!(
                "backing store write failed for page {} of object {:#x}: {}",
                page, geometry.base_addr, err
            );
            return 0;
        }
        state.ever_dirty.set(true, page);
    }

    let group_addr = geometry.base_addr + page_lo * geometry.page_size;
    let group_len = (page_hi - page_lo) * geometry.page_size;
    if let Err(err) = core.backend.drop_pages(group_addr, group_len) {
        warn!(
            "could not drop pages [{}, {}) of object {:#x}: {}",
            page_lo, page_hi, geometry.base_addr, err
        );
        return 0;
    }

    state.residency.set_range(false, page_lo, page_hi);
    state.dirty.set_range(false, page_lo, page_hi);
    let freed = page_hi - page_lo;
    state.resident_pages -= freed;
    debug_assert_eq!(state.residency.count_ones(), state.resident_pages);
    // under the descriptor lock, same contract as the install side
    core.resident_pages.fetch_sub(freed, Ordering::SeqCst);
    drop(state);

    if debug_enabled() {
        trace!(
            "evicted group {} of object {:#x}: pages [{}, {})",
            victim.group,
            geometry.base_addr,
            page_lo,
            page_hi
        );
    }
    freed
}
