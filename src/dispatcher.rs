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
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{error, trace};

use crate::eviction;
use crate::modules::backing_store::BackingStoreModule;
use crate::modules::page_backend::{FaultWait, PageBackendModule};
use crate::object_descriptor::ObjectDescriptor;
use crate::populator;
use crate::vlm_core::{debug_enabled, CoreShared};

/// Budget sweep interval while no faults arrive.
const TICK_MS: i32 = 100;

pub(crate) enum WorkItem<S: BackingStoreModule> {
    /// A routed fault: `page` of `descriptor` was touched.
    Fault {
        descriptor: Arc<ObjectDescriptor<S>>,
        page: usize,
    },
    /// A fault below no live object; answered with a zero page.
    Unrouted { addr: usize },
    /// Periodic budget enforcement.
    Tick,
    /// Poison: the receiving worker exits.
    Shutdown,
}

/// The dispatcher is the single consumer of kernel fault events. It maps
/// each fault address to its owning descriptor (the read-favoring registry
/// lookup) and feeds the bounded work queue; populate work itself happens
/// on the workers. On shutdown it poisons every worker and exits.
pub(crate) fn spawn_dispatcher<B, S>(
    core: Arc<CoreShared<B, S>>,
    queue: kanal::Sender<WorkItem<S>>,
    worker_count: usize,
) -> JoinHandle<()>
where
    B: PageBackendModule + 'static,
    S: BackingStoreModule + 'static,
{
    std::thread::Builder::new()
        .name("vlm-dispatch".into())
        .spawn(move || {
            loop {
                match core.backend.await_fault(TICK_MS) {
                    Ok(FaultWait::Fault { addr }) => {
                        core.lru_epoch.fetch_add(1, Ordering::Relaxed);

                        let item = match core.registry.find_containing(addr) {
                            Some(descriptor) => {
                                let page = descriptor.geometry.page_of_addr(addr);
                                if debug_enabled() {
                                    trace!(
                                        "routing fault {:#x} to object {:#x} page {}",
                                        addr,
                                        descriptor.geometry.base_addr,
                                        page
                                    );
                                }
                                WorkItem::Fault { descriptor, page }
                            }
                            None => WorkItem::Unrouted { addr },
                        };

                        // a full queue blocks fault intake until a worker
                        // drains
                        if queue.send(item).is_err() {
                            break;
                        }
                    }
                    Ok(FaultWait::Timeout) => {
                        // opportunistic sweep; skipped when the queue is busy
                        let _ = queue.try_send(WorkItem::Tick);
                    }
                    Ok(FaultWait::Shutdown) => break,
                    Err(err) => {
                        error!("fault channel broken, dispatcher exiting: {}", err);
                        break;
                    }
                }
            }

            for _ in 0..worker_count {
                let _ = queue.send(WorkItem::Shutdown);
            }
        })
        .expect("could not spawn dispatcher thread")
}

/// Populate/evict worker pool. Each worker owns its scratch buffers and
/// runs until it swallows a poison message.
pub(crate) fn spawn_workers<B, S>(
    core: &Arc<CoreShared<B, S>>,
    queue: kanal::Receiver<WorkItem<S>>,
    count: usize,
) -> Vec<JoinHandle<()>>
where
    B: PageBackendModule + 'static,
    S: BackingStoreModule + 'static,
{
    (0..count)
        .map(|index| {
            let core = core.clone();
            let queue = queue.clone();
            std::thread::Builder::new()
                .name(format!("vlm-worker-{}", index))
                .spawn(move || {
                    let mut window_scratch = Vec::new();
                    let mut elems_scratch = Vec::new();

                    while let Ok(item) = queue.recv() {
                        match item {
                            WorkItem::Fault { descriptor, page } => populator::resolve_fault(
                                &core,
                                &descriptor,
                                page,
                                &mut window_scratch,
                                &mut elems_scratch,
                            ),
                            WorkItem::Unrouted { addr } => {
                                // the range may have been handed to a new
                                // object since dispatch; route again before
                                // giving up on it
                                match core.registry.find_containing(addr) {
                                    Some(descriptor) => {
                                        let page = descriptor.geometry.page_of_addr(addr);
                                        populator::resolve_fault(
                                            &core,
                                            &descriptor,
                                            page,
                                            &mut window_scratch,
                                            &mut elems_scratch,
                                        )
                                    }
                                    None => populator::answer_unrouted(&core, addr),
                                }
                            }
                            WorkItem::Tick => eviction::make_room(&core, 0),
                            WorkItem::Shutdown => break,
                        }
                    }
                })
                .expect("could not spawn worker thread")
        })
        .collect()
}
