//! End-to-end tests driving the cursor-oriented frontend the way the
//! header-iteration and tag-lookup layers do.

use std::rc::Rc;

use camino_tempfile::Utf8TempDir;
use ndb::{Env, Error, SearchType};

const TAG_NAME: u32 = 1000;
const TAG_FILES: u32 = 1117;

#[test]
fn primary_round_trip() {
    let dir = Utf8TempDir::new().unwrap();
    let env = Env::open(dir.path(), false);
    let mut db = env.open_primary().unwrap();
    let mut cursor = db.cursor();

    let id1 = cursor.pkgdb_new().unwrap();
    let id2 = cursor.pkgdb_new().unwrap();
    assert_eq!((id1, id2), (1, 2));
    cursor.pkgdb_put(id1, b"header one").unwrap();
    cursor.pkgdb_put(id2, b"header two").unwrap();

    assert_eq!(&*cursor.pkgdb_get(id1).unwrap(), b"header one");
    assert_eq!(cursor.pkgdb_key(), id1);
    assert!(matches!(cursor.pkgdb_get(99), Err(Error::NotFound)));

    let mut seen = Vec::new();
    let mut cursor = db.cursor();
    while let Some((id, blob)) = cursor.pkgdb_next().unwrap() {
        seen.push((id, blob.to_vec()));
    }
    assert_eq!(
        seen,
        vec![
            (1, b"header one".to_vec()),
            (2, b"header two".to_vec()),
        ]
    );
}

#[test]
fn header_cache_serves_repeat_reads() {
    let dir = Utf8TempDir::new().unwrap();
    let env = Env::open(dir.path(), false);
    let mut db = env.open_primary().unwrap();
    let mut cursor = db.cursor();
    cursor.pkgdb_put(1, b"cached header").unwrap();
    let a = cursor.pkgdb_get(1).unwrap();
    let b = cursor.pkgdb_get(1).unwrap();
    assert!(Rc::ptr_eq(&a, &b), "second read should hit the cache");
    // a write invalidates the cache
    cursor.pkgdb_put(1, b"replaced header").unwrap();
    let c = cursor.pkgdb_get(1).unwrap();
    assert!(!Rc::ptr_eq(&a, &c));
    assert_eq!(&*c, b"replaced header");
}

#[test]
fn index_requires_primary() {
    let dir = Utf8TempDir::new().unwrap();
    let env = Env::open(dir.path(), false);
    assert!(env.open_index(TAG_NAME).is_err());
}

#[test]
fn index_put_get_del() {
    let dir = Utf8TempDir::new().unwrap();
    let env = Env::open(dir.path(), false);
    let _primary = env.open_primary().unwrap();
    let mut names = env.open_index(TAG_NAME).unwrap();
    let mut cursor = names.cursor();

    cursor.idxdb_put(b"bash", 1, 0).unwrap();
    cursor.idxdb_put(b"bash-completion", 2, 0).unwrap();
    cursor.idxdb_put(b"zsh", 3, 0).unwrap();
    cursor.idxdb_put(b"bash", 4, 1).unwrap();

    let mut hits = cursor.idxdb_get(b"bash", SearchType::Normal).unwrap();
    hits.sort_unstable();
    assert_eq!(hits, vec![(1, 0), (4, 1)]);

    let mut hits = cursor.idxdb_get(b"bash", SearchType::Prefix).unwrap();
    hits.sort_unstable();
    assert_eq!(hits, vec![(1, 0), (2, 0), (4, 1)]);

    assert!(matches!(
        cursor.idxdb_get(b"fish", SearchType::Normal),
        Err(Error::NotFound)
    ));
    assert!(matches!(
        cursor.idxdb_get(b"fish", SearchType::Prefix),
        Err(Error::NotFound)
    ));

    cursor.idxdb_del(b"bash", 1, 0).unwrap();
    let hits = cursor.idxdb_get(b"bash", SearchType::Normal).unwrap();
    assert_eq!(hits, vec![(4, 1)]);
}

#[test]
fn index_iteration_yields_every_key() {
    let dir = Utf8TempDir::new().unwrap();
    let env = Env::open(dir.path(), false);
    let _primary = env.open_primary().unwrap();
    let mut files = env.open_index(TAG_FILES).unwrap();
    let mut cursor = files.cursor();
    for i in 0..20u32 {
        cursor
            .idxdb_put(format!("/usr/bin/tool-{i}").as_bytes(), i + 1, 0)
            .unwrap();
    }
    cursor.idxdb_del(b"/usr/bin/tool-7", 8, 0).unwrap();

    let mut cursor = files.cursor();
    let mut seen = Vec::new();
    while let Some((key, hits)) = cursor.idxdb_next().unwrap() {
        assert!(!hits.is_empty());
        assert_eq!(cursor.idxdb_key(), Some(&key[..]));
        seen.push(key);
    }
    assert_eq!(seen.len(), 19);
    assert!(!seen.contains(&b"/usr/bin/tool-7".to_vec()));
}

#[test]
fn cursor_kind_mismatch_is_rejected() {
    let dir = Utf8TempDir::new().unwrap();
    let env = Env::open(dir.path(), false);
    let mut primary = env.open_primary().unwrap();
    let mut index = env.open_index(TAG_NAME).unwrap();
    assert!(primary.cursor().idxdb_put(b"x", 1, 0).is_err());
    assert!(index.cursor().pkgdb_new().is_err());
    assert!(!primary.is_index());
    assert!(index.is_index());
}

#[test]
fn index_sync_records_generation() {
    let dir = Utf8TempDir::new().unwrap();
    let env = Env::open(dir.path(), false);
    let mut primary = env.open_primary().unwrap();
    let _names = env.open_index(TAG_NAME).unwrap();
    primary.cursor().pkgdb_put(1, b"blob").unwrap();
    env.index_sync().unwrap();
    drop(primary);
    drop(env);

    // reopen the raw engines and compare the stored marker
    use std::cell::RefCell;
    let pkgdb = Rc::new(RefCell::new(
        ndb::pkgdb::PkgDb::open(&dir.path().join("Packages.db"), false, false).unwrap(),
    ));
    let generation = pkgdb.borrow_mut().generation().unwrap();
    let mut xdb =
        ndb::xdb::Xdb::open(pkgdb.clone(), &dir.path().join("Index.db"), false, false).unwrap();
    assert_eq!(xdb.get_user_generation().unwrap(), generation);
}

#[test]
fn locks_route_to_primary() {
    let dir = Utf8TempDir::new().unwrap();
    let env = Env::open(dir.path(), false);
    let _primary = env.open_primary().unwrap();
    env.lock(false).unwrap();
    env.lock(true).unwrap();
    env.unlock(true).unwrap();
    env.unlock(false).unwrap();
}

#[test]
fn reopen_sees_everything() {
    let dir = Utf8TempDir::new().unwrap();
    {
        let env = Env::open(dir.path(), false);
        let mut primary = env.open_primary().unwrap();
        let mut cursor = primary.cursor();
        for i in 1..=5u32 {
            let id = cursor.pkgdb_new().unwrap();
            cursor
                .pkgdb_put(id, format!("header {i}").as_bytes())
                .unwrap();
        }
        cursor.pkgdb_del(3).unwrap();
        let mut names = env.open_index(TAG_NAME).unwrap();
        names.cursor().idxdb_put(b"pkg-two", 2, 0).unwrap();
        env.verify().unwrap();
    }
    let env = Env::open(dir.path(), false);
    let mut primary = env.open_primary().unwrap();
    let mut cursor = primary.cursor();
    let mut ids = Vec::new();
    while let Some((id, _)) = cursor.pkgdb_next().unwrap() {
        ids.push(id);
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 4, 5]);
    let mut names = env.open_index(TAG_NAME).unwrap();
    assert_eq!(
        names
            .cursor()
            .idxdb_get(b"pkg-two", SearchType::Normal)
            .unwrap(),
        vec![(2, 0)]
    );
    env.verify().unwrap();
}

#[test]
fn fsync_can_be_disabled() {
    let dir = Utf8TempDir::new().unwrap();
    let env = Env::open(dir.path(), false);
    let mut primary = env.open_primary().unwrap();
    env.set_fsync(false);
    let mut cursor = primary.cursor();
    cursor.pkgdb_put(1, &[0x5a; 100_000]).unwrap();
    assert_eq!(cursor.pkgdb_get(1).unwrap().len(), 100_000);
}

#[test]
fn readonly_env_reads_but_never_writes() {
    let dir = Utf8TempDir::new().unwrap();
    {
        let env = Env::open(dir.path(), false);
        let mut primary = env.open_primary().unwrap();
        primary.cursor().pkgdb_put(1, b"frozen").unwrap();
        let mut names = env.open_index(TAG_NAME).unwrap();
        names.cursor().idxdb_put(b"frozen", 1, 0).unwrap();
    }
    let env = Env::open(dir.path(), true);
    let mut primary = env.open_primary().unwrap();
    let mut cursor = primary.cursor();
    assert_eq!(&*cursor.pkgdb_get(1).unwrap(), b"frozen");
    assert!(cursor.pkgdb_put(2, b"nope").is_err());
    assert!(cursor.pkgdb_del(1).is_err());
}
