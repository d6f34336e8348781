use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use super::{read_element, sequence_source, small_test_config, try_test_core};
use crate::vlm_error::VLMError;
use crate::{arena_free_bytes, destroy_object, new_object, resident_bytes, shutdown};

#[test]
fn test_create_destroy_churn_restores_arena() {
    const OBJECT_COUNT: usize = 100;
    const SEED: u64 = 5446535461589659585;

    let Some(_core) = try_test_core(small_test_config()) else {
        return;
    };

    let initial_free = arena_free_bytes().unwrap();
    let mut rand = SmallRng::seed_from_u64(SEED);

    let mut objects = Vec::new();
    for index in 0..OBJECT_COUNT {
        let (source, _stats) = sequence_source(10_000 + index as u64, 0);
        let base_addr = new_object(source).unwrap();
        // make some pages resident so destruction has something to drop
        assert_eq!(read_element(base_addr, 0, 0), 0);
        objects.push((base_addr, 10_000 + index as u64));
    }

    // no two objects may share a byte of address space
    for (i, &(base_a, len_a)) in objects.iter().enumerate() {
        let end_a = base_a + (len_a as usize * 4 + 4095) / 4096 * 4096;
        for &(base_b, _) in objects.iter().skip(i + 1) {
            assert!(base_b >= end_a || base_b < base_a, "segments overlap");
        }
    }

    assert!(resident_bytes().unwrap() > 0);
    assert!(arena_free_bytes().unwrap() < initial_free);

    // destroy in random order
    while !objects.is_empty() {
        let index = rand.next_u32() as usize % objects.len();
        let (base_addr, _) = objects.swap_remove(index);
        destroy_object(base_addr).unwrap();
    }

    assert_eq!(resident_bytes().unwrap(), 0);
    assert_eq!(arena_free_bytes().unwrap(), initial_free);
}

#[test]
fn test_header_pages_are_host_owned() {
    const HEADER_BYTES: usize = 100;

    let Some(_core) = try_test_core(small_test_config()) else {
        return;
    };

    let (mut source, stats) = sequence_source(10_000, 0);
    source.header_bytes = HEADER_BYTES;
    let base_addr = new_object(source).unwrap();

    // the host writes its header right after construction; the write
    // itself faults the first page in
    for offset in 0..HEADER_BYTES {
        unsafe { std::ptr::write_volatile((base_addr + offset) as *mut u8, 0xAB) };
    }

    // elements live behind the header and were populated by the same
    // boundary-page install
    assert_eq!(read_element(base_addr, 0, HEADER_BYTES), 0);
    assert_eq!(read_element(base_addr, 9_999, HEADER_BYTES), 9_999);
    assert_eq!(stats.call_count(), 1);

    // no populate range covers header bytes: ranges are element indices,
    // and the header survived the element install untouched
    let (start, _) = stats.recorded_ranges()[0];
    assert_eq!(start, 0);
    for offset in 0..HEADER_BYTES {
        let byte = unsafe { std::ptr::read_volatile((base_addr + offset) as *const u8) };
        assert_eq!(byte, 0xAB, "header byte {} was clobbered", offset);
    }

    destroy_object(base_addr).unwrap();
}

#[test]
fn test_double_init_is_rejected() {
    let Some(_core) = try_test_core(small_test_config()) else {
        return;
    };

    assert!(matches!(
        crate::init_with_config(small_test_config()),
        Err(VLMError::AlreadyRunning)
    ));
}

#[test]
fn test_debug_tracing_toggle() {
    let Some(_core) = try_test_core(small_test_config()) else {
        return;
    };

    let (source, _stats) = sequence_source(10_000, 0);
    let base_addr = new_object(source).unwrap();

    // faults taken with tracing on and off behave identically
    crate::set_debug(true);
    assert_eq!(read_element(base_addr, 0, 0), 0);
    crate::set_debug(false);
    assert_eq!(read_element(base_addr, 9_999, 0), 9_999);

    destroy_object(base_addr).unwrap();
}

#[test]
fn test_shutdown_is_idempotent_and_cleans_up() {
    let Some(_core) = try_test_core(small_test_config()) else {
        return;
    };

    let (source, _stats) = sequence_source(10_000, 0);
    let base_addr = new_object(source).unwrap();
    assert_eq!(read_element(base_addr, 42, 0), 42);

    // leaked object: shutdown destroys it with a warning
    shutdown();
    shutdown();

    assert!(matches!(resident_bytes(), Err(VLMError::NotRunning)));
    assert!(matches!(
        destroy_object(base_addr),
        Err(VLMError::NotRunning)
    ));
}
