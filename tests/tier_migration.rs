//! Tier migration tests
//!
//! Spilling to disk and recalling to memory must never change what a caller
//! reads, the reported length, or the position.

use partstream::{
    BackingArena, Channel, SparseBlockBuffer, StreamConfig, Tier, TierConfig, TieredBlockStore,
};
use proptest::prelude::*;
use std::io::SeekFrom;
use tempfile::TempDir;

fn store_in(root: &TempDir, low: u64, high: u64) -> TieredBlockStore {
    TieredBlockStore::with_parts(
        SparseBlockBuffer::new(),
        &TierConfig::with_marks(low, high),
        BackingArena::new(Some(root.path().to_path_buf())),
    )
    .unwrap()
}

fn contents(store: &mut TieredBlockStore) -> Vec<u8> {
    store.seek(SeekFrom::Start(0)).unwrap();
    let mut out = vec![0u8; store.length() as usize];
    let n = store.read_full(&mut out).unwrap();
    out.truncate(n);
    out
}

#[test]
fn test_spill_and_recall_scenario() {
    let root = TempDir::new().unwrap();
    let mut store = store_in(&root, 10, 100);
    let data: Vec<u8> = (0..150u8).collect();

    store.write(&data).unwrap();
    assert_eq!(store.tier(), Tier::Disk);
    assert_eq!(store.len().unwrap(), 150);
    assert_eq!(contents(&mut store), data);

    store.set_len(5).unwrap();
    assert_eq!(store.tier(), Tier::Memory);
    assert_eq!(store.len().unwrap(), 5);
    assert_eq!(contents(&mut store), &data[..5]);
}

#[test]
fn test_spill_directory_lifecycle() {
    let root = TempDir::new().unwrap();
    let arena = BackingArena::new(Some(root.path().to_path_buf()));
    let tiers = TierConfig::with_marks(10, 100);

    let mut first =
        TieredBlockStore::with_parts(SparseBlockBuffer::new(), &tiers, arena.clone()).unwrap();
    let mut second =
        TieredBlockStore::with_parts(SparseBlockBuffer::new(), &tiers, arena.clone()).unwrap();
    first.write(&[1u8; 200]).unwrap();
    second.write(&[2u8; 200]).unwrap();

    assert_eq!(arena.live_files(), 2);
    let dir = arena.directory().unwrap();
    assert!(dir.exists());

    drop(first);
    assert!(dir.exists());
    assert_eq!(arena.live_files(), 1);

    drop(second);
    assert!(!dir.exists());
    assert_eq!(arena.live_files(), 0);
}

#[test]
fn test_backing_dir_from_config() {
    let root = TempDir::new().unwrap();
    let config = StreamConfig::from_toml_str(&format!(
        "[tiers]\nlow_water = 16\nhigh_water = 64\nbacking_dir = {:?}\n",
        root.path().to_string_lossy()
    ))
    .unwrap();

    let mut store = TieredBlockStore::from_config(&config).unwrap();
    store.write(&[5u8; 128]).unwrap();
    assert_eq!(store.tier(), Tier::Disk);
    assert!(store.arena().directory().unwrap().starts_with(root.path()));
}

#[test]
fn test_stores_on_one_backing_dir_share_an_arena() {
    let root = TempDir::new().unwrap();
    let config = StreamConfig::from_toml_str(&format!(
        "[tiers]\nlow_water = 16\nhigh_water = 64\nbacking_dir = {:?}\n",
        root.path().to_string_lossy()
    ))
    .unwrap();

    let mut a = TieredBlockStore::from_config(&config).unwrap();
    let mut b = TieredBlockStore::from_config(&config).unwrap();
    a.write(&[1u8; 128]).unwrap();
    b.write(&[2u8; 128]).unwrap();
    assert_eq!(a.tier(), Tier::Disk);
    assert_eq!(b.tier(), Tier::Disk);

    assert_eq!(a.arena().live_files(), 2);
    assert_eq!(b.arena().live_files(), 2);
    assert_eq!(a.arena().directory(), b.arena().directory());
    assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 1);

    drop(a);
    assert_eq!(b.arena().live_files(), 1);
    assert_eq!(contents(&mut b), vec![2u8; 128]);
}

#[test]
fn test_inverted_marks_are_a_config_error() {
    let mut config = StreamConfig::default();
    config.tiers.low_water = config.tiers.high_water;
    assert!(matches!(
        TieredBlockStore::from_config(&config),
        Err(partstream::StreamError::Config(_))
    ));
}

#[test]
fn test_writes_after_spill_keep_sparse_layout() {
    let root = TempDir::new().unwrap();
    let mut store = store_in(&root, 10, 100);

    store.write(&[1u8; 120]).unwrap();
    store.seek(SeekFrom::Start(10_000)).unwrap();
    store.write(b"tail").unwrap();

    assert_eq!(store.tier(), Tier::Disk);
    assert_eq!(store.buffered_bytes(), 124);

    let data = contents(&mut store);
    assert_eq!(data.len(), 10_004);
    assert!(data[120..10_000].iter().all(|&b| b == 0));
    assert_eq!(&data[10_000..], b"tail");
}

proptest! {
    #[test]
    fn prop_tiering_is_invisible(
        writes in prop::collection::vec((0u64..2000, prop::collection::vec(any::<u8>(), 1..200)), 1..25),
        truncate_to in 0u64..2000,
    ) {
        let root = TempDir::new().unwrap();
        let mut tiered = store_in(&root, 64, 256);
        let mut reference = SparseBlockBuffer::new();

        for (offset, data) in &writes {
            tiered.seek(SeekFrom::Start(*offset)).unwrap();
            tiered.write(data).unwrap();
            reference.seek(SeekFrom::Start(*offset)).unwrap();
            reference.write(data).unwrap();

            prop_assert_eq!(tiered.position(), reference.position());
            prop_assert_eq!(tiered.length(), reference.length());
        }

        if truncate_to < reference.length() {
            tiered.set_len(truncate_to).unwrap();
            reference.set_len(truncate_to).unwrap();
        }

        let mut expected = vec![0u8; reference.length() as usize];
        reference.seek(SeekFrom::Start(0)).unwrap();
        reference.read_full(&mut expected).unwrap();
        prop_assert_eq!(contents(&mut tiered), expected);
    }
}
