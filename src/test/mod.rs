use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::vlm_config::VLMConfig;
use crate::vlm_source::{
    ElementKind, PopulateCallout, PopulateError, PopulateSource, VLMSource,
};
use crate::{init_with_config, shutdown};

mod lifecycle;

/// The core is a process-wide singleton, so scenario tests have to run one
/// at a time. A panicking test must not wedge the rest of the suite.
static TEST_MUTEX: Mutex<()> = Mutex::new(());

pub(crate) struct CoreTestGuard {
    _lock: MutexGuard<'static, ()>,
}

impl Drop for CoreTestGuard {
    fn drop(&mut self) {
        shutdown();
    }
}

/// Serializes the test, starts the core with `config` and stops it again
/// when the guard drops. Returns `None` where the kernel offers no
/// userfaultfd (the scenario tests are skipped there, the pure-logic
/// tests still run).
pub(crate) fn try_test_core(config: VLMConfig) -> Option<CoreTestGuard> {
    let lock = TEST_MUTEX.lock().unwrap_or_else(PoisonError::into_inner);
    let _ = env_logger::builder().is_test(true).try_init();

    // a previously panicked test may have leaked a running core
    shutdown();

    match init_with_config(config) {
        Ok(()) => Some(CoreTestGuard { _lock: lock }),
        Err(err) => {
            eprintln!("skipping scenario test, core unavailable: {}", err);
            None
        }
    }
}

pub(crate) fn small_test_config() -> VLMConfig {
    VLMConfig {
        // plenty of address space, tests never fill 4 GiB
        arena_bytes: 4 << 30,
        budget_bytes: 64 << 20,
        ..VLMConfig::default()
    }
}

/// Shared observation point between a test and its populate source.
#[derive(Default)]
pub(crate) struct PopulateStats {
    pub calls: AtomicU64,
    pub ranges: Mutex<Vec<(u64, u64)>>,
}

impl PopulateStats {
    pub(crate) fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn recorded_ranges(&self) -> Vec<(u64, u64)> {
        self.ranges.lock().unwrap().clone()
    }

    fn record(&self, range: &Range<u64>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ranges.lock().unwrap().push((range.start, range.end));
    }
}

/// `populate(i..j)` yields the little-endian values `i, i+1, ..., j-1`.
pub(crate) struct SequenceSource {
    pub stats: Arc<PopulateStats>,
}

impl PopulateSource for SequenceSource {
    fn populate(
        &self,
        range: Range<u64>,
        _callout: &mut PopulateCallout,
        out: &mut [u8],
    ) -> Result<(), PopulateError> {
        self.stats.record(&range);

        assert_eq!(out.len(), (range.end - range.start) as usize * 4);
        for (slot, value) in out.chunks_exact_mut(4).zip(range.clone()) {
            slot.copy_from_slice(&(value as i32).to_le_bytes());
        }
        Ok(())
    }
}

/// Always reports the given status.
pub(crate) struct FailingSource {
    pub status: i32,
    pub stats: Arc<PopulateStats>,
}

impl PopulateSource for FailingSource {
    fn populate(
        &self,
        range: Range<u64>,
        _callout: &mut PopulateCallout,
        _out: &mut [u8],
    ) -> Result<(), PopulateError> {
        self.stats.record(&range);
        Err(PopulateError::new(self.status))
    }
}

pub(crate) fn sequence_source(
    n_elements: u64,
    min_load_elements: u64,
) -> (VLMSource, Arc<PopulateStats>) {
    let stats = Arc::new(PopulateStats::default());
    let source = VLMSource {
        source: Box::new(SequenceSource {
            stats: stats.clone(),
        }),
        element_kind: ElementKind::Integer,
        n_elements,
        element_size: 4,
        header_bytes: 0,
        dims: None,
        min_load_elements,
    };
    (source, stats)
}

/// Reads element `index` of an object of 4-byte ints straight out of the
/// demand-paged range.
pub(crate) fn read_element(base_addr: usize, index: u64, header_bytes: usize) -> i32 {
    unsafe {
        std::ptr::read_volatile((base_addr + header_bytes + index as usize * 4) as *const i32)
    }
}

/// Merges recorded populate ranges and asserts they cover `[0, n)` exactly.
pub(crate) fn assert_full_coverage(stats: &PopulateStats, n_elements: u64) {
    let mut ranges = stats.recorded_ranges();
    ranges.sort_unstable();

    let mut covered_to = 0u64;
    for (start, end) in ranges {
        assert!(
            start <= covered_to,
            "gap in populate coverage before element {}",
            start
        );
        covered_to = covered_to.max(end);
    }
    assert_eq!(covered_to, n_elements, "populate coverage stops early");
}
