//! End-to-end tests through the public API: open a session, take slots,
//! bind scratch memory, touch registers, close.

use meram::config::{ConfigSource, ReservedRange};
use meram::mapping::{Backing, LocalMappingConfig};
use meram::memory::MemorySegment;
use meram::prelude::*;
use std::io::Write;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;

const CONFIG: &str = "\
# LCDC owns the first 64 blocks
reserved 0 63
reserved 200 255
ipmmui vpu 0x8c000000 16
";

fn registry_with(config: &str, scratch_blocks: usize) -> Registry {
    Registry::with_local_mapping(
        SessionConfig::default().with_inline(config),
        LocalMappingConfig::default().with_scratch_blocks(scratch_blocks),
    )
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_full_lifecycle() {
    let registry = registry_with(CONFIG, 512);
    let session = registry.open().unwrap();

    let mut icb = session.acquire_slot(12).unwrap();
    let blocks = required_memory_size(1920, 8);
    assert_eq!(blocks, 16);

    let offset = icb.bind_memory(blocks).unwrap();
    assert!(offset >= 64);
    assert!(offset + blocks <= 200 || offset > 255);

    icb.write(0x0, offset as u32).unwrap();
    assert_eq!(icb.read(0x0).unwrap(), offset as u32);

    session.fill_region(offset, blocks, 0).unwrap();
    assert_eq!(session.tag("vpu").unwrap().size, 16);

    icb.release();
    assert!(!registry.arbiter().is_held(12));

    session.close();
    assert_eq!(registry.ref_count(), 0);
    assert!(!registry.is_mapped());
}

#[test]
fn test_config_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();

    let registry = Registry::with_local_mapping(
        SessionConfig::default().with_source(ConfigSource::Path(file.path().to_path_buf())),
        LocalMappingConfig::default(),
    );
    let session = registry.open().unwrap();

    let reserved: Vec<_> = session.config().reserved.iter().copied().collect();
    assert_eq!(
        reserved,
        vec![ReservedRange::new(0, 63), ReservedRange::new(200, 255)]
    );
}

#[test]
fn test_missing_config_file_fails_open() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::with_local_mapping(
        SessionConfig::default().with_source(ConfigSource::Path(dir.path().join("meram.conf"))),
        LocalMappingConfig::default(),
    );

    assert!(matches!(registry.open(), Err(Error::ConfigRead { .. })));
    assert_eq!(registry.ref_count(), 0);
}

#[test]
fn test_slot_state_survives_remap() {
    let registry = registry_with("", 64);

    let first = registry.open().unwrap();
    let icb = first.acquire_slot(0).unwrap();
    let second = registry.open().unwrap();
    icb.release();
    first.close();
    second.close();
    assert!(!registry.is_mapped());

    let session = registry.open().unwrap();
    assert_eq!(registry.arbiter().stats().acquisitions, 1);
    session.try_acquire_slot(0).unwrap();
}

#[test]
fn test_shared_memory_backing() {
    let registry = Registry::with_local_mapping(
        SessionConfig::default().with_source(ConfigSource::Empty),
        LocalMappingConfig::default()
            .with_scratch_blocks(32)
            .with_backing(Backing::SharedMemory),
    );
    let session = registry.open().unwrap();

    let range = session.alloc_region(4).unwrap();
    session.fill_region(range.offset, range.size, 0x5a5a_5a5a).unwrap();

    let scratch = session.mapping().window(WindowKind::Scratch).unwrap();
    assert_eq!(scratch.read_u32(range.byte_offset()).unwrap(), 0x5a5a_5a5a);
}

// ============================================================================
// Allocation
// ============================================================================

#[test]
fn test_allocations_never_touch_reserved() {
    let registry = registry_with(CONFIG, 512);
    let session = registry.open().unwrap();
    let reserved = session.config().reserved.clone();

    let mut live = Vec::new();
    for size in [1, 3, 8, 16, 5, 32, 2].iter().cycle().take(60) {
        match session.alloc_region(*size) {
            Ok(range) => live.push(range),
            Err(Error::AllocationExhausted { .. }) => break,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert!(!live.is_empty());
    for range in &live {
        assert!(
            reserved.first_overlap(range.offset, range.last_block()).is_none(),
            "{range:?} touches a reserved range"
        );
    }
    for (i, a) in live.iter().enumerate() {
        for b in &live[i + 1..] {
            assert!(a.last_block() < b.offset || b.last_block() < a.offset);
        }
    }
}

#[test]
fn test_free_then_alloc_reuses() {
    let registry = registry_with(CONFIG, 512);
    let session = registry.open().unwrap();

    let range = session.alloc_region(10).unwrap();
    session.free_region(range);
    assert_eq!(session.alloc_region(10).unwrap(), range);
}

#[test]
fn test_concurrent_bind_release() {
    let registry = Arc::new(registry_with(CONFIG, 512));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                let session = registry.open().unwrap();
                let reserved = session.config().reserved.clone();
                for i in 0..100 {
                    let mut icb = session
                        .acquire_slot_timeout((t * 7 + i) % 16, Duration::from_secs(5))
                        .unwrap();
                    if let Ok(offset) = icb.bind_memory(4) {
                        assert!(reserved.first_overlap(offset, offset + 3).is_none());
                    }
                    icb.release();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(registry.arbiter().held_count(), 0);
    assert_eq!(registry.ref_count(), 0);
}
