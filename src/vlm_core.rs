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

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use log::{debug, info, warn};

use crate::dispatcher::{self, WorkItem};
use crate::eviction::EvictionEngine;
use crate::modules::backing_store::{BackingStoreModule, FileBackingStore};
use crate::modules::page_backend::{PageBackendModule, UffdPageBackend};
use crate::modules::segment_allocator::{FirstFitSegmentAllocator, SegmentAllocatorModule};
use crate::object_descriptor::{ObjectDescriptor, ObjectGeometry};
use crate::object_registry::ObjectRegistry;
use crate::util::ceil_to_page;
use crate::vlm_config::VLMConfig;
use crate::vlm_error::VLMError;
use crate::vlm_source::VLMSource;

/// Gates the per-fault/per-evict trace lines; hot paths check this instead
/// of paying for formatting.
static DEBUG: AtomicBool = AtomicBool::new(false);

/// Toggles trace logging of faults, populates and evictions.
pub fn set_debug(enabled: bool) {
    DEBUG.store(enabled, Ordering::Relaxed);
    info!(
        "fault tracing {}",
        if enabled { "enabled" } else { "disabled" }
    );
}

pub(crate) fn debug_enabled() -> bool {
    DEBUG.load(Ordering::Relaxed)
}

/// Everything the dispatcher, the workers and the host operations share.
pub(crate) struct CoreShared<B: PageBackendModule, S: BackingStoreModule> {
    pub(crate) config: VLMConfig,
    pub(crate) backend: B,
    pub(crate) arena_base: usize,
    pub(crate) arena_len: usize,
    pub(crate) page_size: usize,
    pub(crate) budget_pages: usize,
    pub(crate) arena: Mutex<FirstFitSegmentAllocator>,
    pub(crate) registry: ObjectRegistry<S>,
    pub(crate) resident_pages: AtomicUsize,
    pub(crate) lru_epoch: AtomicU64,
    pub(crate) evictor: EvictionEngine,
}

impl<B: PageBackendModule, S: BackingStoreModule> CoreShared<B, S> {
    fn new_object_inner(&self, source: VLMSource, multidim: bool) -> Result<usize, VLMError> {
        source.validate(multidim)?;

        let min_load_elements = if source.min_load_elements == 0 {
            self.config.default_min_load_elements
        } else {
            source.min_load_elements
        };

        let range_bytes = source.header_bytes + source.n_elements as usize * source.element_size;
        let segment_len = ceil_to_page(range_bytes, self.page_size);

        let offset = self.arena.lock().unwrap().allocate(segment_len)?;
        let base_addr = self.arena_base + offset;

        // a reply to a fault that outlived its object may have parked stale
        // zero pages here; start from a clean slate
        if let Err(err) = self.backend.drop_pages(base_addr, segment_len) {
            self.arena.lock().unwrap().free(offset, segment_len);
            return Err(err);
        }

        let backing = match S::open(&self.config.scratch_dir, self.page_size) {
            Ok(backing) => backing,
            Err(err) => {
                self.arena.lock().unwrap().free(offset, segment_len);
                return Err(err);
            }
        };

        let geometry = ObjectGeometry::new(
            base_addr,
            self.page_size,
            source.n_elements,
            source.element_size,
            source.header_bytes,
            min_load_elements,
        );
        debug_assert_eq!(geometry.segment_len, segment_len);

        let descriptor = Arc::new(ObjectDescriptor::new(
            geometry,
            source.element_kind,
            source.dims,
            source.source,
            backing,
        ));
        self.registry.insert(descriptor);

        debug!(
            "new object at {:#x}: {} elements x {} bytes, {} header bytes, {} pages in groups of {}",
            base_addr,
            geometry.n_elements,
            geometry.element_size,
            geometry.header_bytes,
            geometry.n_pages,
            geometry.pages_per_group
        );
        Ok(base_addr)
    }

    fn destroy_inner(&self, base_addr: usize) -> Result<(), VLMError> {
        let descriptor = self
            .registry
            .remove(base_addr)
            .ok_or(VLMError::NoSuchObject { base_addr })?;
        let geometry = descriptor.geometry;

        // taking the lock waits out any in-flight populate or evict on this
        // object; faults still queued answer with a bare wake afterwards
        let (resident, source, backing) = {
            let mut state = descriptor.state.lock().unwrap();
            state.terminating = true;
            let resident = state.resident_pages;
            state.resident_pages = 0;
            state.residency.set_range(false, 0, geometry.n_pages);
            // under the descriptor lock, in step with the install/evict sides
            self.resident_pages.fetch_sub(resident, Ordering::SeqCst);
            (resident, state.source.take(), state.backing.take())
        };

        if let Err(err) = self.backend.drop_pages(geometry.base_addr, geometry.segment_len) {
            warn!(
                "could not drop pages of object {:#x} at destruction: {}",
                base_addr, err
            );
        }

        // closes the unlinked swap file
        drop(backing);
        // the source destructor, outside of any lock
        drop(source);

        self.arena
            .lock()
            .unwrap()
            .free(geometry.base_addr - self.arena_base, geometry.segment_len);

        debug!("destroyed object at {:#x} ({} resident pages dropped)", base_addr, resident);
        Ok(())
    }
}

type DefaultBackend = UffdPageBackend;
type DefaultStore = FileBackingStore;

struct CoreRuntime {
    shared: Arc<CoreShared<DefaultBackend, DefaultStore>>,
    work_queue: kanal::Sender<WorkItem<DefaultStore>>,
    dispatcher: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

static CORE: Mutex<Option<CoreRuntime>> = Mutex::new(None);

fn core_guard() -> std::sync::MutexGuard<'static, Option<CoreRuntime>> {
    // a panicking test must not wedge every later use of the singleton
    CORE.lock().unwrap_or_else(PoisonError::into_inner)
}

fn start(config: VLMConfig) -> Result<CoreRuntime, VLMError> {
    let config = config.sanitized();

    let backend = DefaultBackend::new()?;
    let page_size = backend.page_size();

    let arena_len = ceil_to_page(config.arena_bytes, page_size);
    let arena_base = backend.map_arena(arena_len)?;
    if let Err(err) = backend.register_range(arena_base, arena_len) {
        backend.unmap_arena(arena_base, arena_len);
        return Err(err);
    }

    let mut arena = FirstFitSegmentAllocator::new();
    arena.init(arena_len);

    let budget_pages = (config.budget_bytes / page_size).max(1);
    let worker_count = config.worker_threads;
    let queue_depth = config.queue_depth;

    let shared = Arc::new(CoreShared {
        backend,
        arena_base,
        arena_len,
        page_size,
        budget_pages,
        arena: Mutex::new(arena),
        registry: ObjectRegistry::new(),
        resident_pages: AtomicUsize::new(0),
        lru_epoch: AtomicU64::new(1),
        evictor: EvictionEngine::new(),
        config,
    });

    let (work_queue, work_receiver) = kanal::bounded(queue_depth);
    let workers = dispatcher::spawn_workers(&shared, work_receiver, worker_count);
    let dispatcher = dispatcher::spawn_dispatcher(shared.clone(), work_queue.clone(), worker_count);

    info!(
        "core started: arena of {} bytes at {:#x}, budget {} pages, {} workers",
        arena_len, arena_base, budget_pages, worker_count
    );

    Ok(CoreRuntime {
        shared,
        work_queue,
        dispatcher: Some(dispatcher),
        workers,
    })
}

fn with_core<R>(
    f: impl FnOnce(&Arc<CoreShared<DefaultBackend, DefaultStore>>) -> Result<R, VLMError>,
) -> Result<R, VLMError> {
    let guard = core_guard();
    match guard.as_ref() {
        Some(runtime) => f(&runtime.shared),
        None => Err(VLMError::NotRunning),
    }
}

/// Starts the core with an explicit configuration instead of the
/// environment-derived one the first `new_object` would use.
pub fn init_with_config(config: VLMConfig) -> Result<(), VLMError> {
    let mut guard = core_guard();
    if guard.is_some() {
        return Err(VLMError::AlreadyRunning);
    }
    *guard = Some(start(config)?);
    Ok(())
}

fn new_object_impl(source: VLMSource, multidim: bool) -> Result<usize, VLMError> {
    let mut guard = core_guard();
    let runtime = match guard.as_mut() {
        Some(runtime) => runtime,
        None => guard.insert(start(VLMConfig::from_env())?),
    };
    runtime.shared.new_object_inner(source, multidim)
}

/// Creates an object and returns the base address of its range. Starts the
/// core on first use.
pub fn new_object(source: VLMSource) -> Result<usize, VLMError> {
    new_object_impl(source, false)
}

/// Like `new_object` for shaped data; `dims` must be present and multiply
/// to `n_elements`.
pub fn new_object_multidim(source: VLMSource) -> Result<usize, VLMError> {
    new_object_impl(source, true)
}

/// Tears an object down: waits for in-flight fault handling, drops every
/// resident page, deletes the swap file, runs the source destructor and
/// returns the segment to the arena.
pub fn destroy_object(base_addr: usize) -> Result<(), VLMError> {
    with_core(|shared| shared.destroy_inner(base_addr))
}

/// Stops the core: destroys leaked objects (with a warning), stops the
/// dispatcher and the workers, unregisters and releases the arena.
/// Idempotent; never fails.
pub fn shutdown() {
    let mut guard = core_guard();
    let Some(mut runtime) = guard.take() else {
        return;
    };
    drop(guard);

    for base_addr in runtime.shared.registry.bases() {
        warn!("object at {:#x} still live at shutdown", base_addr);
        if let Err(err) = runtime.shared.destroy_inner(base_addr) {
            warn!("could not destroy object at {:#x}: {}", base_addr, err);
        }
    }

    runtime.shared.backend.signal_shutdown();
    if let Some(handle) = runtime.dispatcher.take() {
        let _ = handle.join();
    }
    // the dispatcher poisons the pool on a clean exit; repeating the
    // poison here covers a dispatcher that died early
    for _ in 0..runtime.workers.len() {
        let _ = runtime.work_queue.send(WorkItem::Shutdown);
    }
    for handle in runtime.workers.drain(..) {
        let _ = handle.join();
    }

    if let Err(err) = runtime
        .shared
        .backend
        .unregister_range(runtime.shared.arena_base, runtime.shared.arena_len)
    {
        warn!("could not unregister arena: {}", err);
    }
    runtime
        .shared
        .backend
        .unmap_arena(runtime.shared.arena_base, runtime.shared.arena_len);

    info!("core stopped");
}

/// Sticky error status of an object: `Some(status)` after a failed
/// populate, `None` while clean.
pub fn object_error(base_addr: usize) -> Result<Option<i32>, VLMError> {
    with_core(|shared| {
        let descriptor = shared
            .registry
            .get(base_addr)
            .ok_or(VLMError::NoSuchObject { base_addr })?;
        Ok(descriptor.error())
    })
}

/// Raises the recorded fault-path failure of an object as a typed error;
/// `Ok` while the object is clean.
pub fn check_object(base_addr: usize) -> Result<(), VLMError> {
    match object_error(base_addr)? {
        None => Ok(()),
        Some(status) => Err(VLMError::PopulateFailed { status }),
    }
}

/// Number of elements of an object.
pub fn object_len(base_addr: usize) -> Result<u64, VLMError> {
    with_core(|shared| {
        let descriptor = shared
            .registry
            .get(base_addr)
            .ok_or(VLMError::NoSuchObject { base_addr })?;
        Ok(descriptor.geometry.n_elements)
    })
}

/// Shape vector of a multidim object, `None` for flat objects.
pub fn object_dims(base_addr: usize) -> Result<Option<Vec<u64>>, VLMError> {
    with_core(|shared| {
        let descriptor = shared
            .registry
            .get(base_addr)
            .ok_or(VLMError::NoSuchObject { base_addr })?;
        Ok(descriptor.dims.clone())
    })
}

/// Declares that the host wrote the object-relative byte range `[start,
/// end)`. Pages covering it are flushed to the backing store before they
/// are evicted and restored from there afterwards.
pub fn mark_dirty(base_addr: usize, start: usize, end: usize) -> Result<(), VLMError> {
    with_core(|shared| {
        let descriptor = shared
            .registry
            .get(base_addr)
            .ok_or(VLMError::NoSuchObject { base_addr })?;
        let geometry = &descriptor.geometry;

        if start >= end {
            return Ok(());
        }
        if end > geometry.range_bytes {
            return Err(VLMError::InvalidSource("dirty range outside the object"));
        }

        let page_lo = start / geometry.page_size;
        let page_hi = crate::util::div_round_up(end, geometry.page_size);

        let mut state = descriptor.state.lock().unwrap();
        for page in page_lo..page_hi {
            // only a resident page can hold host writes
            if state.residency.is_set(page) {
                state.dirty.set(true, page);
            }
        }
        Ok(())
    })
}

/// Bytes currently RAM-backed across all live objects.
pub fn resident_bytes() -> Result<usize, VLMError> {
    with_core(|shared| Ok(shared.resident_pages.load(Ordering::SeqCst) * shared.page_size))
}

/// Unallocated bytes of the arena reservation.
pub fn arena_free_bytes() -> Result<usize, VLMError> {
    with_core(|shared| Ok(shared.arena.lock().unwrap().free_bytes()))
}
