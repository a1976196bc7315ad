mod common;

use anyhow::Result;
use common::{pid, seeded_db, CONTAINER};
use pretty_assertions::assert_eq;
use storage::{EngineConfig, LockMode, Record, StorageError};

#[test]
fn least_recently_loaded_clean_page_is_evicted() -> Result<()> {
    let t = seeded_db(EngineConfig::default().with_cache_pages(2), 3)?;
    let db = &t.db;

    let tid = db.begin();
    db.get_page(tid, pid(0), LockMode::Shared)?;
    db.get_page(tid, pid(1), LockMode::Shared)?;
    assert_eq!(db.cache().resident_pages(), vec![pid(0), pid(1)]);

    db.get_page(tid, pid(2), LockMode::Shared)?;
    assert_eq!(db.cache().resident_pages(), vec![pid(1), pid(2)]);
    assert_eq!(db.cache().len(), db.cache().capacity());

    // Eviction drops the page, not the lock
    assert!(db.holds_lock(tid, pid(0)));
    db.commit_transaction(tid)?;
    Ok(())
}

#[test]
fn cache_full_of_dirty_pages_is_exhausted() -> Result<()> {
    let t = seeded_db(EngineConfig::default().with_cache_pages(2), 3)?;
    let db = &t.db;

    let writer = db.begin();
    for page_no in 0..2 {
        let handle = db.get_page(writer, pid(page_no), LockMode::Exclusive)?;
        handle.write().add_record(b"dirty").unwrap();
        db.cache().mark_dirty(pid(page_no), writer)?;
    }

    let reader = db.begin();
    let err = db.get_page(reader, pid(2), LockMode::Shared).unwrap_err();
    assert!(matches!(err, StorageError::EvictionExhausted { capacity: 2 }));
    assert!(!err.is_retryable());

    // Nothing reached disk ahead of the commit
    assert_eq!(t.on_disk(0)?.records().count(), 1);

    db.commit_transaction(writer)?;
    db.get_page(reader, pid(2), LockMode::Shared)?;
    assert_eq!(t.on_disk(0)?.records().count(), 2);
    db.commit_transaction(reader)?;
    Ok(())
}

#[test]
fn discarded_page_is_reloaded_from_disk() -> Result<()> {
    let t = seeded_db(EngineConfig::default(), 1)?;
    let db = &t.db;

    let tid = db.begin();
    let handle = db.get_page(tid, pid(0), LockMode::Exclusive)?;
    handle.write().add_record(b"scratch").unwrap();
    drop(handle);

    assert!(db.discard_page(pid(0)));
    assert!(!db.cache().is_resident(pid(0)));

    let handle = db.get_page(tid, pid(0), LockMode::Shared)?;
    assert_eq!(handle.read().records().count(), 1);
    db.commit_transaction(tid)?;
    Ok(())
}

#[test]
fn flush_all_writes_every_dirty_page() -> Result<()> {
    let t = seeded_db(EngineConfig::default(), 3)?;
    let db = &t.db;

    let tids = [db.begin(), db.begin()];
    for (page_no, &tid) in tids.iter().enumerate() {
        let handle = db.get_page(tid, pid(page_no as u32), LockMode::Exclusive)?;
        handle.write().add_record(b"bulk").unwrap();
        db.cache().mark_dirty(pid(page_no as u32), tid)?;
    }

    assert_eq!(db.flush_all_pages()?, 2);
    assert!(db.cache().dirty_pages().is_empty());
    assert_eq!(t.on_disk(0)?.records().count(), 2);
    assert_eq!(t.on_disk(1)?.records().count(), 2);

    for tid in tids {
        db.commit_transaction(tid)?;
    }
    Ok(())
}

#[test]
fn flush_pages_is_scoped_to_one_transaction() -> Result<()> {
    let t = seeded_db(EngineConfig::default(), 2)?;
    let db = &t.db;

    let t1 = db.begin();
    let t2 = db.begin();
    db.insert_tuple(t1, CONTAINER, &mut Record::new(&b"first"[..]))?;
    let handle = db.get_page(t2, pid(1), LockMode::Exclusive)?;
    handle.write().add_record(b"second").unwrap();
    db.cache().mark_dirty(pid(1), t2)?;

    assert_eq!(db.flush_pages(t1)?, 1);
    assert_eq!(db.cache().dirty_pages(), vec![(pid(1), t2)]);

    db.commit_transaction(t1)?;
    db.abort_transaction(t2)?;
    Ok(())
}
