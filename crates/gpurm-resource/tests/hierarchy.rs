use std::sync::Arc;
use std::thread;

use gpurm_resource::{ResourceError, ResourceTable};

#[test]
fn destroying_a_root_removes_its_children() {
    let table = ResourceTable::new();
    table.create(0x2000, None, "root").unwrap();
    table.create(0x2001, Some(0x2000), "child").unwrap();
    assert_eq!(*table.lookup(0x2001).unwrap().payload(), "child");

    table.destroy(0x2000).unwrap();

    assert_eq!(
        table.lookup(0x2000).unwrap_err(),
        ResourceError::NotFound(0x2000)
    );
    assert_eq!(
        table.lookup(0x2001).unwrap_err(),
        ResourceError::NotFound(0x2001)
    );
}

#[test]
fn duplicate_handles_and_missing_parents_are_rejected() {
    let table = ResourceTable::new();
    table.create(1, None, ()).unwrap();

    assert_eq!(
        table.create(1, None, ()).unwrap_err(),
        ResourceError::AlreadyExists(1)
    );
    assert_eq!(
        table.create(2, Some(99), ()).unwrap_err(),
        ResourceError::ParentNotFound(99)
    );
    // A failed create leaves nothing behind.
    assert!(!table.contains(2));
    assert_eq!(table.len(), 1);
}

#[test]
fn destroying_twice_reports_not_found() {
    let table = ResourceTable::new();
    table.create(7, None, ()).unwrap();
    table.destroy(7).unwrap();
    assert_eq!(table.destroy(7).unwrap_err(), ResourceError::NotFound(7));
}

#[test]
fn deep_trees_are_torn_down_completely() {
    let table = ResourceTable::new();
    table.create(0, None, ()).unwrap();
    for handle in 1..500u64 {
        table.create(handle, Some(handle - 1), ()).unwrap();
    }
    let removed = table.destroy(0).unwrap();
    assert_eq!(removed.len(), 500);
    assert_eq!(removed.first().unwrap().handle(), 499);
    assert!(table.is_empty());
}

#[test]
fn concurrent_create_and_destroy_keep_the_table_consistent() {
    let table = Arc::new(ResourceTable::new());
    table.create(0x1, None, ()).unwrap();

    let workers: Vec<_> = (0..8u64)
        .map(|t| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 0..200u64 {
                    let handle = 0x1_0000 * (t + 1) + i;
                    table.create(handle, Some(0x1), ()).unwrap();
                    table.create(handle | 0x8000, Some(handle), ()).unwrap();
                    if i % 2 == 0 {
                        assert_eq!(table.destroy(handle).unwrap().len(), 2);
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let root = table.lookup(0x1).unwrap();
    assert_eq!(root.children().len(), 8 * 100);
    assert_eq!(table.len(), 1 + 8 * 100 * 2);

    table.destroy(0x1).unwrap();
    assert!(table.is_empty());
}
