//! Stress tests for slot arbitration across sessions and threads.

use meram::arbiter::{MAX_SLOT_INDEX, SLOT_COUNT};
use meram::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

fn registry() -> Registry {
    Registry::with_local_mapping(
        SessionConfig::default().with_source(ConfigSource::Empty),
        LocalMappingConfig::default().with_scratch_blocks(64),
    )
}

/// Every slot index can be held at once.
#[test]
fn test_all_slots_held() {
    let registry = registry();
    let session = registry.open().unwrap();

    let handles: Vec<_> = (0..SLOT_COUNT)
        .map(|index| session.try_acquire_slot(index).unwrap())
        .collect();
    assert_eq!(registry.arbiter().held_count(), SLOT_COUNT);
    assert!(matches!(
        session.try_acquire_slot(MAX_SLOT_INDEX + 1),
        Err(Error::InvalidIndex { .. })
    ));

    drop(handles);
    assert_eq!(registry.arbiter().held_count(), 0);
}

/// Many threads hammering few slots through the session API never see two
/// owners of one index.
#[test]
fn test_session_handles_single_owner() {
    let registry = registry();
    let owners: Vec<AtomicUsize> = (0..3).map(|_| AtomicUsize::new(0)).collect();

    thread::scope(|s| {
        for t in 0..6 {
            let registry = &registry;
            let owners = &owners;
            s.spawn(move || {
                let session = registry.open().unwrap();
                for i in 0..300 {
                    let index = (t + i) % 3;
                    let icb = session.acquire_slot(index).unwrap();
                    assert_eq!(owners[index].fetch_add(1, Ordering::SeqCst), 0);
                    owners[index].fetch_sub(1, Ordering::SeqCst);
                    drop(icb);
                }
            });
        }
    });

    assert_eq!(registry.arbiter().held_count(), 0);
    assert_eq!(registry.arbiter().stats().acquisitions, 6 * 300);
}

/// Non-blocking acquisitions either win or fail immediately.
#[test]
fn test_try_acquire_never_blocks() {
    let registry = registry();
    let session = registry.open().unwrap();
    let _held = session.acquire_slot(42).unwrap();

    thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                s.spawn(|| {
                    let start = Instant::now();
                    for _ in 0..1000 {
                        assert!(session.try_acquire_slot(42).is_err());
                    }
                    start.elapsed()
                })
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap() < Duration::from_secs(5));
        }
    });

    assert_eq!(registry.arbiter().stats().rejections, 4000);
    assert_eq!(registry.arbiter().stats().waits, 0);
}

/// Waiters blocked on one slot each get it in turn once it is released.
#[test]
fn test_waiters_handed_off_in_turn() {
    let registry = registry();
    let session = registry.open().unwrap();
    let held = session.acquire_slot(5).unwrap();
    let done = AtomicUsize::new(0);

    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                let icb = session.acquire_slot(5).unwrap();
                done.fetch_add(1, Ordering::SeqCst);
                icb.release();
            });
        }

        thread::sleep(Duration::from_millis(20));
        assert_eq!(done.load(Ordering::SeqCst), 0);
        held.release();
    });

    assert_eq!(done.load(Ordering::SeqCst), 4);
    assert!(!registry.arbiter().is_held(5));
}
