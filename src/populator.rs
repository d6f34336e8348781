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

use log::{error, trace, warn};

use crate::eviction;
use crate::modules::backing_store::BackingStoreModule;
use crate::modules::page_backend::PageBackendModule;
use crate::object_descriptor::{DescriptorState, ObjectDescriptor};
use crate::vlm_core::{debug_enabled, CoreShared};
use crate::vlm_source::PopulateCallout;

/// Materializes the install-unit group around `page` of `descriptor`.
///
/// The faulting host thread is blocked inside a memory read until the
/// install step; every path out of here must either install pages over the
/// faulted address or wake the range so the access retries.
///
/// `window` and `elems` are worker-owned scratch buffers reused across
/// faults.
pub(crate) fn resolve_fault<B: PageBackendModule, S: BackingStoreModule>(
    core: &CoreShared<B, S>,
    descriptor: &ObjectDescriptor<S>,
    page: usize,
    window: &mut Vec<u8>,
    elems: &mut Vec<u8>,
) {
    let geometry = &descriptor.geometry;
    let group = geometry.group_of_page(page);
    let (page_lo, page_hi) = geometry.group_pages(group);

    // cheap raced/terminating check before any eviction work
    {
        let state = descriptor.state.lock().unwrap();
        if state.terminating {
            drop(state);
            wake_page(core, geometry.base_addr + page * geometry.page_size, geometry.page_size);
            return;
        }
        if state.residency.is_set(page) {
            // another fault on the same group won; the install woke every
            // waiter and the kernel retries the access
            return;
        }
    }

    // make room for the incoming group before taking the descriptor lock,
    // so the eviction engine is free to victimize this object as well
    eviction::make_room(core, page_hi - page_lo);

    let mut state = descriptor.state.lock().unwrap();
    if state.terminating {
        drop(state);
        wake_page(core, geometry.base_addr + page * geometry.page_size, geometry.page_size);
        return;
    }
    if state.residency.is_set(page) {
        return;
    }

    let (byte_lo, byte_hi) = geometry.group_bytes(group);
    window.clear();
    window.resize(byte_hi - byte_lo, 0);

    let failed_status = fill_window(descriptor, &mut state, byte_lo, byte_hi, window, elems);
    if let Some(status) = failed_status {
        descriptor.record_error(status);
        error!(
            "populate failed with status {} for object {:#x} pages [{}, {}); installing zero pages",
            status, geometry.base_addr, page_lo, page_hi
        );
        // window content is discarded, the group becomes zero pages; the
        // next fault after eviction retries the callback
        window.iter_mut().for_each(|byte| *byte = 0);
    }

    // install every non-resident run of the window (pure header pages that
    // faulted earlier stay untouched)
    let mut installed = 0usize;
    let mut p = page_lo;
    while p < page_hi {
        if state.residency.is_set(p) {
            p += 1;
            continue;
        }
        let run_lo = p;
        while p < page_hi && !state.residency.is_set(p) {
            p += 1;
        }

        let dst = geometry.base_addr + run_lo * geometry.page_size;
        let src = &window[run_lo * geometry.page_size - byte_lo..p * geometry.page_size - byte_lo];
        match core.backend.install_pages(dst, src) {
            Ok(()) => {
                state.residency.set_range(true, run_lo, p);
                installed += p - run_lo;
            }
            Err(err) => {
                error!("page install failed at {:#x}: {}", dst, err);
                descriptor.record_error(-1);
                // last resort: let the faulted threads retry
                let _ = core.backend.wake_range(dst, (p - run_lo) * geometry.page_size);
            }
        }
    }

    state.resident_pages += installed;
    debug_assert_eq!(state.residency.count_ones(), state.resident_pages);
    state.group_epoch[group] = core.lru_epoch.load(std::sync::atomic::Ordering::Relaxed);
    // still under the descriptor lock: destruction snapshots the per-object
    // count and subtracts it from this counter, the two must agree
    core.resident_pages
        .fetch_add(installed, std::sync::atomic::Ordering::SeqCst);
    drop(state);

    if debug_enabled() {
        trace!(
            "installed group {} of object {:#x}: pages [{}, {}), {} new",
            group,
            geometry.base_addr,
            page_lo,
            page_hi,
            installed
        );
    }
}

/// Fills the scratch window for `[byte_lo, byte_hi)`: populate callback
/// output overlaid with backing-store images of previously dirty-evicted
/// pages. Returns the failure status when the callback rejects the range.
fn fill_window<S: BackingStoreModule>(
    descriptor: &ObjectDescriptor<S>,
    state: &mut DescriptorState<S>,
    byte_lo: usize,
    byte_hi: usize,
    window: &mut [u8],
    elems: &mut Vec<u8>,
) -> Option<i32> {
    let geometry = &descriptor.geometry;
    let page_size = geometry.page_size;
    let (page_lo, page_hi) = (byte_lo / page_size, byte_hi / page_size);

    let Some((start, end)) = geometry.element_span(byte_lo, byte_hi) else {
        // pure header window, stays zero for the host to fill
        return None;
    };

    // the callback runs only for content the backing store cannot supply
    let all_restorable = (page_lo..page_hi)
        .filter(|&p| !geometry.is_pure_header_page(p))
        .all(|p| state.ever_dirty.is_set(p));

    if !all_restorable {
        let elems_len = (end - start) as usize * geometry.element_size;
        elems.clear();
        elems.resize(elems_len, 0);

        let mut callout = PopulateCallout::new();
        let source = state.source.as_ref().expect("live object without source");
        if debug_enabled() {
            trace!(
                "populate object {:#x} elements [{}, {})",
                geometry.base_addr,
                start,
                end
            );
        }
        if let Err(populate_error) = source.populate(start..end, &mut callout, elems) {
            return Some(populate_error.status);
        }

        // copy the overlap: the element span may start before the window
        // (straddling element) and end after it (clamped object tail)
        let span_lo = geometry.element_offset(start);
        let data_lo = byte_lo.max(geometry.header_bytes);
        let data_hi = byte_hi.min(geometry.range_bytes);
        window[data_lo - byte_lo..data_hi - byte_lo]
            .copy_from_slice(&elems[data_lo - span_lo..data_hi - span_lo]);
    }

    // overlay pages whose last image lives in the backing store
    for p in page_lo..page_hi {
        if !state.ever_dirty.is_set(p) {
            continue;
        }
        let window_off = p * page_size - byte_lo;
        let backing = state.backing.as_mut().expect("live object without backing");
        if let Err(err) = backing.read_page(p, &mut window[window_off..window_off + page_size]) {
            warn!(
                "backing store read failed for page {} of object {:#x}: {}",
                p, geometry.base_addr, err
            );
            descriptor.record_error(-1);
            // the zeroed page is installed in its place
        }
    }

    None
}

/// Answers a fault no live object claims. This happens when a queued fault
/// outlives its object; the thread must be released regardless.
pub(crate) fn answer_unrouted<B: PageBackendModule, S: BackingStoreModule>(
    core: &CoreShared<B, S>,
    addr: usize,
) {
    let page_size = core.page_size;
    let page_addr = addr & !(page_size - 1);
    warn!("fault at {:#x} hit no live object, answering with a zero page", addr);
    if core.backend.install_zero_pages(page_addr, page_size).is_err() {
        let _ = core.backend.wake_range(page_addr, page_size);
    }
}

fn wake_page<B: PageBackendModule, S: BackingStoreModule>(
    core: &CoreShared<B, S>,
    addr: usize,
    len: usize,
) {
    if let Err(err) = core.backend.wake_range(addr, len) {
        warn!("wake failed at {:#x}: {}", addr, err);
    }
}
