//! End-to-end scans against the synthetic kernel.
//!
//! Every test goes through the public API only: a `Volume` over a scratch
//! descriptor, with `FakeKernel` answering the ioctls.

use std::ops::ControlFlow;
use std::os::fd::AsFd;

use bdup_config::{InoPathsConfig, SearchConfig};
use bdup_ioctl::abi::{key_type, ROOT_TREE_OBJECTID};
use bdup_ioctl::testing::{payload, FakeKernel};
use bdup_ioctl::{BtreeKey, ChangeRecord, SearchKey, Volume};

fn pages_of(items_per_page: u32) -> (SearchConfig, InoPathsConfig) {
    (SearchConfig { items_per_page }, InoPathsConfig::default())
}

#[test]
fn test_root_generation_is_maximum_of_root_items() {
    let mut kernel = FakeKernel::new(7);
    for (offset, generation) in [5u64, 9, 3].into_iter().enumerate() {
        kernel.insert(
            ROOT_TREE_OBJECTID,
            7,
            key_type::ROOT_ITEM,
            offset as u64,
            generation,
            payload::root_item(generation, Some(generation)),
        );
    }
    // Neighbouring roots must not leak into the answer.
    kernel.insert(ROOT_TREE_OBJECTID, 6, key_type::ROOT_ITEM, 0, 40, payload::root_item(40, None));
    kernel.insert(ROOT_TREE_OBJECTID, 8, key_type::ROOT_ITEM, 0, 50, payload::root_item(50, None));

    let file = tempfile::tempfile().unwrap();
    for page in [1, 2, 4096] {
        let (search, ino_paths) = pages_of(page);
        let volume = Volume::with_kernel(file.as_fd(), &kernel).with_config(search, ino_paths);
        assert_eq!(volume.root_generation_of(7).unwrap(), 9, "page size {page}");
        assert_eq!(volume.root_generation().unwrap(), 9, "page size {page}");
    }
}

#[test]
fn test_find_new_reports_new_extent_then_ref() {
    let mut kernel = FakeKernel::new(5);
    kernel.insert(0, 257, key_type::EXTENT_DATA, 0, 9, payload::file_extent(2, 4096));
    kernel.insert(0, 257, key_type::EXTENT_DATA, 4096, 9, payload::file_extent(8, 4096));
    kernel.insert(0, 258, key_type::INODE_REF, 256, 9, payload::inode_ref(3, b"a.txt"));

    let file = tempfile::tempfile().unwrap();
    let (search, ino_paths) = pages_of(2);
    let volume = Volume::with_kernel(file.as_fd(), &kernel).with_config(search, ino_paths);

    let mut out = Vec::new();
    let summary = volume.find_new(5, &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert_eq!(
        text.lines().collect::<Vec<_>>(),
        vec![
            "item type 108 ino 257 len 53 gen0 9 gen1 8",
            "item type 12 ino 258 len 15 gen0 9 name a.txt",
        ]
    );
    assert_eq!(summary.reported, 2);
    assert_eq!(summary.stale, 1);
    assert!(summary.pages >= 2);
}

#[test]
fn test_find_new_ignores_old_leaves() {
    let mut kernel = FakeKernel::new(5);
    kernel.insert(0, 257, key_type::INODE_REF, 256, 3, payload::inode_ref(2, b"old"));
    kernel.insert(0, 258, key_type::INODE_REF, 256, 12, payload::inode_ref(3, b"new"));

    let file = tempfile::tempfile().unwrap();
    let volume = Volume::with_kernel(file.as_fd(), &kernel);

    let mut names = Vec::new();
    volume
        .scan_changes(10, |record| {
            if let ChangeRecord::InodeRef { name, .. } = record {
                names.push(name.clone());
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(names, vec![b"new".to_vec()]);
}

#[test]
fn test_every_page_size_drains_in_order() {
    let mut kernel = FakeKernel::new(5);
    let mut expected = Vec::new();
    for objectid in 256..320u64 {
        for (item_type, offset) in [
            (key_type::INODE_ITEM, 0),
            (key_type::INODE_REF, 256),
            (key_type::EXTENT_DATA, 0),
            (key_type::EXTENT_DATA, u64::MAX),
        ] {
            kernel.insert(0, objectid, item_type, offset, 1, vec![0; 24]);
            expected.push(BtreeKey::new(objectid, item_type, offset));
        }
    }

    let file = tempfile::tempfile().unwrap();
    for page in [1, 3, 7, 64, 4096] {
        let (search, ino_paths) = pages_of(page);
        let volume = Volume::with_kernel(file.as_fd(), &kernel).with_config(search, ino_paths);
        let mut seen = Vec::new();
        volume
            .search_each(SearchKey::new(0), |item| {
                seen.push(item.key());
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(seen, expected, "page size {page}");
    }
}

#[test]
fn test_paths_of_changed_inode() {
    let mut kernel = FakeKernel::new(5);
    kernel.insert(0, 300, key_type::EXTENT_DATA, 0, 20, payload::file_extent(20, 8192));
    kernel.set_paths(300, &["photos/a.jpg", "backup/a.jpg"]);

    let file = tempfile::tempfile().unwrap();
    let volume = Volume::with_kernel(file.as_fd(), &kernel);

    let mut changed = Vec::new();
    volume
        .scan_changes(10, |record| {
            changed.push(record.objectid());
            Ok(())
        })
        .unwrap();
    assert_eq!(changed, vec![300]);

    let paths: Vec<_> = volume
        .ino_paths(300)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(paths.len(), 2);
    assert!(paths.iter().all(|p| p.ends_with("a.jpg")));
}
