//!
//! Database frontend.
//!
//! An [`Env`] stands for one database home directory and hands out [`Db`]
//! handles: one primary (the package store in `Packages.db`) and any number
//! of secondary indexes (each a tag inside `Index.db`). The environment is
//! reference counted, owns the engine handles shared by all `Db`s, and
//! memoizes the most recently read package blob so a hot read path does
//! not hit the store twice for the same header.
//!
//! All iteration state lives in an explicit [`Cursor`]: package iteration
//! walks a stable snapshot of the id list in file order, index iteration
//! walks the key list in hash order and yields each nonempty posting list.
//!

use std::cell::RefCell;
use std::io::ErrorKind;
use std::rc::Rc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::error::{Error, Result};
use crate::idxdb::IdxDb;
use crate::pkgdb::PkgDb;
use crate::xdb::Xdb;

const PKGDB_FILE: &str = "Packages.db";
const XDB_FILE: &str = "Index.db";

struct EnvInner {
    home: Utf8PathBuf,
    rdonly: bool,
    dofsync: bool,
    pkgdb: Option<Rc<RefCell<PkgDb>>>,
    xdb: Option<Rc<RefCell<Xdb>>>,
    /// most recently read package header, keyed by package id
    cached: Option<(u32, Rc<[u8]>)>,
}

/// One database home directory. Cloning is cheap and shares the underlying
/// engine handles.
#[derive(Clone)]
pub struct Env {
    inner: Rc<RefCell<EnvInner>>,
}

/// How an index lookup treats the key argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchType {
    /// Exact key match.
    Normal,
    /// Every key starting with the given bytes.
    Prefix,
}

impl Env {
    pub fn open(home: &Utf8Path, rdonly: bool) -> Env {
        Env {
            inner: Rc::new(RefCell::new(EnvInner {
                home: home.to_owned(),
                rdonly,
                dofsync: true,
                pkgdb: None,
                xdb: None,
                cached: None,
            })),
        }
    }

    pub fn home(&self) -> Utf8PathBuf {
        self.inner.borrow().home.clone()
    }

    fn pkgdb(&self) -> Result<Rc<RefCell<PkgDb>>> {
        self.inner
            .borrow()
            .pkgdb
            .clone()
            .ok_or(Error::InvalidArg("primary database is not open"))
    }

    /// Open the primary package database, creating it when absent (unless
    /// the environment is read-only).
    pub fn open_primary(&self) -> Result<Db> {
        let mut inner = self.inner.borrow_mut();
        if inner.pkgdb.is_none() {
            let path = inner.home.join(PKGDB_FILE);
            debug!("opening db index {}", path);
            let mut pkgdb = match PkgDb::open(&path, false, inner.rdonly) {
                Ok(pkgdb) => pkgdb,
                Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound && !inner.rdonly => {
                    PkgDb::open(&path, true, false)?
                }
                Err(e) => return Err(e),
            };
            pkgdb.set_fsync(inner.dofsync);
            inner.pkgdb = Some(Rc::new(RefCell::new(pkgdb)));
        }
        let pkgdb = inner.pkgdb.clone().expect("primary just opened");
        drop(inner);
        Ok(Db {
            env: self.clone(),
            kind: DbKind::Primary(pkgdb),
        })
    }

    /// Open a secondary index bound to `tag`. The primary must be open
    /// first; it provides the lock and the generation counter.
    pub fn open_index(&self, tag: u32) -> Result<Db> {
        let pkgdb = self.pkgdb()?;
        let mut inner = self.inner.borrow_mut();
        if inner.xdb.is_none() {
            let path = inner.home.join(XDB_FILE);
            debug!("opening db index {}", path);
            // open the index file read-write if at all possible, even when
            // the packages were opened read-only
            let mut xdb = if !inner.rdonly {
                Xdb::open(pkgdb.clone(), &path, true, false)?
            } else {
                match Xdb::open(pkgdb.clone(), &path, false, false) {
                    Ok(xdb) => xdb,
                    Err(Error::Io(_)) => Xdb::open(pkgdb.clone(), &path, false, true)?,
                    Err(e) => return Err(e),
                }
            };
            xdb.set_fsync(inner.dofsync);
            inner.xdb = Some(Rc::new(RefCell::new(xdb)));
        }
        let xdb = inner.xdb.clone().expect("index store just opened");
        drop(inner);
        debug!("opening db index tag {}", tag);
        let idxdb = IdxDb::open(xdb, tag)?;
        Ok(Db {
            env: self.clone(),
            kind: DbKind::Index(idxdb),
        })
    }

    /// Toggle fsync on every engine this environment owns.
    pub fn set_fsync(&self, dofsync: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.dofsync = dofsync;
        if let Some(pkgdb) = &inner.pkgdb {
            pkgdb.borrow_mut().set_fsync(dofsync);
        }
        if let Some(xdb) = &inner.xdb {
            xdb.borrow_mut().set_fsync(dofsync);
        }
    }

    /// Re-check the package store: every live blob must verify.
    pub fn verify(&self) -> Result<()> {
        self.pkgdb()?.borrow_mut().verify()
    }

    /// Take the database lock shared (`excl = false`) or exclusive.
    pub fn lock(&self, excl: bool) -> Result<()> {
        self.pkgdb()?.borrow_mut().lock(excl)
    }

    pub fn unlock(&self, excl: bool) -> Result<()> {
        self.pkgdb()?.borrow_mut().unlock(excl)
    }

    /// Stamp the index store with the package store's current generation
    /// so readers can detect a stale index cheaply.
    pub fn index_sync(&self) -> Result<()> {
        let pkgdb = self.pkgdb()?;
        let xdb = self
            .inner
            .borrow()
            .xdb
            .clone()
            .ok_or(Error::InvalidArg("index store is not open"))?;
        pkgdb.borrow_mut().lock(true)?;
        let generation = pkgdb.borrow_mut().generation();
        // the pkgdb borrow must be gone here: the index store re-takes it
        // for its own locking
        let rc = match generation {
            Ok(generation) => xdb.borrow_mut().set_user_generation(generation),
            Err(e) => Err(e),
        };
        let _ = pkgdb.borrow_mut().unlock(true);
        rc
    }

    fn cached_get(&self, pkgidx: u32) -> Option<Rc<[u8]>> {
        match &self.inner.borrow().cached {
            Some((idx, blob)) if *idx == pkgidx => Some(blob.clone()),
            _ => None,
        }
    }

    fn cache_put(&self, pkgidx: u32, blob: Rc<[u8]>) {
        self.inner.borrow_mut().cached = Some((pkgidx, blob));
    }

    fn cache_clear(&self) {
        self.inner.borrow_mut().cached = None;
    }
}

enum DbKind {
    Primary(Rc<RefCell<PkgDb>>),
    Index(IdxDb),
}

/// One open database: the primary package store or one secondary index.
pub struct Db {
    env: Env,
    kind: DbKind,
}

impl Db {
    pub fn cursor(&mut self) -> Cursor<'_> {
        Cursor {
            db: self,
            list: None,
            keys: None,
            ilist: 0,
            key: None,
            hdrnum: 0,
        }
    }

    pub fn is_index(&self) -> bool {
        matches!(self.kind, DbKind::Index(_))
    }

    fn primary(&self) -> Result<&Rc<RefCell<PkgDb>>> {
        match &self.kind {
            DbKind::Primary(pkgdb) => Ok(pkgdb),
            DbKind::Index(_) => Err(Error::InvalidArg("cursor is bound to an index")),
        }
    }

    fn index(&mut self) -> Result<&mut IdxDb> {
        match &mut self.kind {
            DbKind::Index(idxdb) => Ok(idxdb),
            DbKind::Primary(_) => Err(Error::InvalidArg("cursor is bound to the primary")),
        }
    }
}

/// Iteration and lookup state over one [`Db`].
pub struct Cursor<'a> {
    db: &'a mut Db,
    /// package ids still to visit (primary iteration)
    list: Option<Vec<u32>>,
    /// keys still to visit (index iteration)
    keys: Option<Vec<Vec<u8>>>,
    ilist: usize,
    key: Option<Vec<u8>>,
    hdrnum: u32,
}

impl<'a> Cursor<'a> {
    /*** Primary operations ***/

    /// Reserve a fresh package id.
    pub fn pkgdb_new(&mut self) -> Result<u32> {
        let hdrnum = self.db.primary()?.borrow_mut().next_pkg_idx()?;
        self.db.env.cache_clear();
        Ok(hdrnum)
    }

    /// Store the header blob for `hdrnum`.
    pub fn pkgdb_put(&mut self, hdrnum: u32, blob: &[u8]) -> Result<()> {
        self.db.primary()?.borrow_mut().put(hdrnum, blob)?;
        self.hdrnum = hdrnum;
        self.db.env.cache_clear();
        Ok(())
    }

    pub fn pkgdb_del(&mut self, hdrnum: u32) -> Result<()> {
        self.hdrnum = 0;
        self.db.env.cache_clear();
        self.db.primary()?.borrow_mut().del(hdrnum)
    }

    /// Fetch the header blob for `hdrnum`, served from the environment
    /// cache when it was the last one read.
    pub fn pkgdb_get(&mut self, hdrnum: u32) -> Result<Rc<[u8]>> {
        if let Some(blob) = self.db.env.cached_get(hdrnum) {
            return Ok(blob);
        }
        let blob: Rc<[u8]> = self.db.primary()?.borrow_mut().get(hdrnum)?.into();
        self.hdrnum = hdrnum;
        self.db.env.cache_put(hdrnum, blob.clone());
        Ok(blob)
    }

    /// Advance package iteration. The id list is a stable snapshot taken
    /// on the first call; records deleted in the meantime are skipped.
    pub fn pkgdb_next(&mut self) -> Result<Option<(u32, Rc<[u8]>)>> {
        if self.list.is_none() {
            self.list = Some(self.db.primary()?.borrow_mut().list()?);
            self.ilist = 0;
        }
        let list = self.list.as_ref().expect("snapshot just taken");
        while self.ilist < list.len() {
            let hdrnum = list[self.ilist];
            self.ilist += 1;
            match self.db.primary()?.borrow_mut().get(hdrnum) {
                Ok(blob) => {
                    let blob: Rc<[u8]> = blob.into();
                    self.hdrnum = hdrnum;
                    self.db.env.cache_put(hdrnum, blob.clone());
                    return Ok(Some((hdrnum, blob)));
                }
                Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// The package id of the last record this cursor touched.
    pub fn pkgdb_key(&self) -> u32 {
        self.hdrnum
    }

    /*** Index operations ***/

    /// Look up the posting list for `key`. A prefix search re-lists the
    /// keys and merges the posting lists of every match.
    pub fn idxdb_get(&mut self, key: &[u8], search: SearchType) -> Result<Vec<(u32, u32)>> {
        match search {
            SearchType::Normal => self.db.index()?.get(key),
            SearchType::Prefix => {
                let keys = self.db.index()?.list()?;
                let mut set = Vec::new();
                let mut found = false;
                for k in keys {
                    if !k.starts_with(key) {
                        continue;
                    }
                    match self.db.index()?.get(&k) {
                        Ok(mut hits) => {
                            found = true;
                            set.append(&mut hits);
                        }
                        Err(Error::NotFound) => {}
                        Err(e) => return Err(e),
                    }
                }
                if found {
                    Ok(set)
                } else {
                    Err(Error::NotFound)
                }
            }
        }
    }

    pub fn idxdb_put(&mut self, key: &[u8], hdrnum: u32, tagnum: u32) -> Result<()> {
        self.db.index()?.put(key, hdrnum, tagnum)
    }

    pub fn idxdb_del(&mut self, key: &[u8], hdrnum: u32, tagnum: u32) -> Result<()> {
        self.db.index()?.del(key, hdrnum, tagnum)
    }

    /// Advance index iteration: yields each key with a nonempty posting
    /// list, in hash order.
    pub fn idxdb_next(&mut self) -> Result<Option<(Vec<u8>, Vec<(u32, u32)>)>> {
        if self.keys.is_none() {
            self.keys = Some(self.db.index()?.list()?);
            self.ilist = 0;
        }
        loop {
            let keys = self.keys.as_ref().expect("key list just taken");
            if self.ilist >= keys.len() {
                return Ok(None);
            }
            let key = keys[self.ilist].clone();
            self.ilist += 1;
            match self.db.index()?.get(&key) {
                Ok(hits) if !hits.is_empty() => {
                    self.key = Some(key.clone());
                    return Ok(Some((key, hits)));
                }
                Ok(_) | Err(Error::NotFound) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// The key of the last index entry this cursor yielded.
    pub fn idxdb_key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }
}
