//!
//! Sub-blob store.
//!
//! One file (`Index.db`) hosts any number of variable-size blobs on behalf
//! of clients, each addressed by a (tag, subtag) pair. The layout mirrors
//! the package store, at page instead of block granularity:
//!
//! ```text
//! offset 0                     header: magic 'RpmX', version, generation,
//!                              slotnpages, pagesize, usergeneration
//! offset 32                    slot entries, 16 bytes each
//! offset pagesize * slotnpages blob area, page-aligned
//! ```
//!
//! A slot entry is `(magic 'Slo' | subtag << 24, blobtag, startpage,
//! pagecnt)`; `startpage == 0` marks a free slot. A used slot with
//! `pagecnt == 0` is "empty but allocated": its startpage is written as 1
//! on disk but treated as the first post-slot page in memory.
//!
//! In memory the used slots form a doubly-linked list sorted by startpage,
//! threaded through two sentinels: slot 0 (whose `pagecnt` carries the slot
//! page count) and slot `nslots` (whose `startpage` carries the file length
//! in pages). Free slots form a singly-linked chain anchored at
//! `firstfree`. The list is rebuilt from the slot array on every header
//! read, so it never survives a generation change.
//!
//! Clients may map a blob and register a [`BlobMapClient`]; the store calls
//! it back with the new window whenever the blob is resized or relocated,
//! and with `None` when the blob is unmapped or destroyed.
//!
//! The store has no lock of its own: it shares the package store's
//! advisory lock so that operations on the pair are serialized as one.
//!

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::rc::Rc;

use byteorder::{ByteOrder, LittleEndian};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, error};

use crate::error::{corrupt, Error, Result};
use crate::mmap::{BlobView, Mapping};
use crate::pkgdb::{fsync_dir, PkgDb};

const XDB_MAGIC: u32 = u32::from_le_bytes(*b"RpmX");
const XDB_VERSION: u32 = 0;

const OFFSET_MAGIC: usize = 0;
const OFFSET_VERSION: usize = 4;
const OFFSET_GENERATION: usize = 8;
const OFFSET_SLOTNPAGES: usize = 12;
const OFFSET_PAGESIZE: usize = 16;
const OFFSET_USERGENERATION: usize = 20;

// must be a multiple of SLOT_SIZE
const HEADER_SIZE: usize = 32;

// low three bytes of the slot magic word; the subtag lives in the top byte
const SLOT_MAGIC: u32 = u32::from_le_bytes(*b"Slo\0");

const SLOT_SIZE: usize = 16;
const SLOT_START: u32 = (HEADER_SIZE / SLOT_SIZE) as u32;

/// Page size used for newly created files.
const XDB_PAGE_SIZE: u32 = 4096;

/// Receiver for blob relocation events.
///
/// The callback fires while the store is mid-operation; implementations
/// must only stash the new view away and must not call back into the
/// store.
pub trait BlobMapClient {
    fn map_changed(&self, view: Option<BlobView>);
}

#[derive(Default)]
struct XdbSlot {
    slotno: u32,
    blobtag: u32,
    subtag: u32,
    startpage: u32,
    pagecnt: u32,
    next: u32,
    prev: u32,
    mapping: Option<Mapping>,
    map_writable: bool,
    client: Option<Rc<dyn BlobMapClient>>,
}

/// Summary counters for inspection tools.
#[derive(Debug, Clone)]
pub struct XdbStats {
    pub path: Utf8PathBuf,
    pub generation: u32,
    pub slot_pages: u32,
    pub blob_pages: u32,
    pub free_pages: u32,
    pub pagesize: u32,
    pub blobs: Vec<XdbBlobInfo>,
}

#[derive(Debug, Clone)]
pub struct XdbBlobInfo {
    pub id: u32,
    pub blobtag: u32,
    pub subtag: u32,
    pub startpage: u32,
    pub pagecnt: u32,
    pub mapped: bool,
}

pub struct Xdb {
    pkgdb: Rc<RefCell<PkgDb>>,
    file: File,
    path: Utf8PathBuf,
    rdonly: bool,

    pagesize: u32,
    generation: u32,
    slotnpages: u32,
    usergeneration: u32,

    /// header and slot pages, mapped while the header is valid
    mapped: Option<Mapping>,
    mapped_rw: bool,

    /// index 0 and index `nslots` are the sentinels; empty when stale
    slots: Vec<XdbSlot>,
    nslots: u32,
    firstfree: u32,
    usedblobpages: u32,

    dofsync: bool,
    locked_excl: u32,
}

impl Xdb {
    /// Open the sub-blob store at `path`. `pkgdb` provides the advisory
    /// lock that serializes this file with the package store.
    pub fn open(
        pkgdb: Rc<RefCell<PkgDb>>,
        path: &Utf8Path,
        create: bool,
        rdonly: bool,
    ) -> Result<Xdb> {
        let file = OpenOptions::new()
            .read(true)
            .write(!rdonly)
            .create(create && !rdonly)
            .open(path)?;
        let mut xdb = Xdb {
            pkgdb,
            file,
            path: path.to_owned(),
            rdonly,
            pagesize: 0,
            generation: 0,
            slotnpages: 0,
            usergeneration: 0,
            mapped: None,
            mapped_rw: false,
            slots: Vec::new(),
            nslots: 0,
            firstfree: 0,
            usedblobpages: 0,
            dofsync: true,
            locked_excl: 0,
        };
        if xdb.file.metadata()?.len() == 0 {
            fsync_dir(path)?;
            xdb.init()?;
        }
        debug!("opened blob store {}", path);
        Ok(xdb)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn is_rdonly(&self) -> bool {
        self.rdonly
    }

    pub fn pagesize(&self) -> u32 {
        self.pagesize
    }

    pub fn set_fsync(&mut self, dofsync: bool) {
        self.dofsync = dofsync;
    }

    /*** Locking ***/

    fn lock_only(&mut self, excl: bool) -> Result<()> {
        if excl && self.rdonly {
            return Err(Error::ReadOnly);
        }
        self.pkgdb.borrow_mut().lock(excl)?;
        if excl {
            self.locked_excl += 1;
        }
        Ok(())
    }

    /// Take the shared (or exclusive) lock and refresh the slot metadata,
    /// firing relocation callbacks for anything another process moved. The
    /// header stays mapped read-only; use this when only blob contents are
    /// going to be touched.
    pub fn lock(&mut self, excl: bool) -> Result<()> {
        self.lock_only(excl)?;
        if let Err(e) = self.read_header(false) {
            let _ = self.unlock(excl);
            return Err(e);
        }
        Ok(())
    }

    pub fn unlock(&mut self, excl: bool) -> Result<()> {
        if excl && self.locked_excl > 0 {
            self.locked_excl -= 1;
            if self.locked_excl == 0 && self.mapped.is_some() && self.mapped_rw {
                // drop write access to the header with the lock
                self.mapped = None;
                let _ = self.map_header(self.slotnpages, false);
            }
        }
        self.pkgdb.borrow_mut().unlock(excl)
    }

    /// Like [`Xdb::lock`], but maps the header read-write when the lock is
    /// exclusive. All mutating operations in this module use this.
    fn lock_read_header(&mut self, excl: bool) -> Result<()> {
        self.lock_only(excl)?;
        if let Err(e) = self.read_header(excl) {
            let _ = self.unlock(excl);
            return Err(e);
        }
        Ok(())
    }

    /*** Header management ***/

    fn read_header_raw(&self) -> Result<(u32, u32, u32, u32)> {
        let mut header = [0u8; HEADER_SIZE];
        self.file.read_exact_at(&mut header, 0)?;
        if LittleEndian::read_u32(&header[OFFSET_MAGIC..]) != XDB_MAGIC {
            return Err(corrupt(format!("{}: bad magic", self.path)));
        }
        let version = LittleEndian::read_u32(&header[OFFSET_VERSION..]);
        if version != XDB_VERSION {
            error!(
                "{}: version mismatch, expected {}, found {}",
                self.path, XDB_VERSION, version
            );
            return Err(corrupt(format!("{}: version {}", self.path, version)));
        }
        let generation = LittleEndian::read_u32(&header[OFFSET_GENERATION..]);
        let slotnpages = LittleEndian::read_u32(&header[OFFSET_SLOTNPAGES..]);
        let pagesize = LittleEndian::read_u32(&header[OFFSET_PAGESIZE..]);
        let usergeneration = LittleEndian::read_u32(&header[OFFSET_USERGENERATION..]);
        if slotnpages == 0 || pagesize == 0 {
            return Err(corrupt(format!("{}: bad header counts", self.path)));
        }
        Ok((generation, slotnpages, pagesize, usergeneration))
    }

    fn map_header(&mut self, slotnpages: u32, rw: bool) -> Result<()> {
        let len = slotnpages as usize * self.pagesize as usize;
        self.mapped = Some(Mapping::new(&self.file, 0, len, rw)?);
        self.mapped_rw = rw;
        Ok(())
    }

    /// Re-read the header and slot pages unless the cached generation still
    /// matches, then reconcile the new slot metadata with the previous one:
    /// clients of blobs that moved, resized or vanished get their callbacks.
    fn read_header(&mut self, rw: bool) -> Result<()> {
        if let Some(mapped) = &self.mapped {
            if mapped.view().get_u32(OFFSET_GENERATION) == self.generation {
                if rw && !self.mapped_rw {
                    self.mapped = None;
                    self.map_header(self.slotnpages, rw)?;
                }
                return Ok(());
            }
            self.mapped = None;
        }
        let filelen = self.file.metadata()?.len();
        let (generation, slotnpages, pagesize, usergeneration) = self.read_header_raw()?;
        if filelen % pagesize as u64 != 0 {
            return Err(corrupt(format!(
                "{}: file size {} not a multiple of the page size",
                self.path, filelen
            )));
        }
        self.pagesize = pagesize;
        self.map_header(slotnpages, rw)?;
        let view = self.mapped.as_ref().expect("header just mapped").view();

        // read in all slots
        let spp = pagesize / SLOT_SIZE as u32; // slots per page
        let nslots = slotnpages * spp - SLOT_START + 1;
        let mut slots: Vec<XdbSlot> = Vec::with_capacity(nslots as usize + 1);
        slots.resize_with(nslots as usize + 1, XdbSlot::default);
        let mut used: Vec<u32> = Vec::new();
        let mut usedblobpages = 0;
        let mut firstfree = 0u32;
        let mut lastfree = 0u32;
        let mut slotno = 1u32;
        for page in 0..slotnpages {
            let mut o = if page == 0 {
                (SLOT_START as usize) * SLOT_SIZE
            } else {
                0
            };
            while o < pagesize as usize {
                let base = page as usize * pagesize as usize + o;
                let w = view.get_u32(base);
                if w & 0x00ff_ffff != SLOT_MAGIC {
                    self.mapped = None;
                    return Err(corrupt(format!("{}: bad slot magic", self.path)));
                }
                let slot = &mut slots[slotno as usize];
                slot.slotno = slotno;
                slot.subtag = (w >> 24) & 255;
                slot.blobtag = view.get_u32(base + 4);
                slot.startpage = view.get_u32(base + 8);
                slot.pagecnt = view.get_u32(base + 12);
                if slot.pagecnt == 0 && slot.startpage != 0 {
                    // empty but allocated: parked at the first post-slot page
                    slot.startpage = slotnpages;
                }
                if slot.startpage == 0 {
                    if lastfree == 0 {
                        firstfree = slotno;
                    } else {
                        slots[lastfree as usize].next = slotno;
                    }
                    lastfree = slotno;
                } else {
                    used.push(slotno);
                    usedblobpages += slots[slotno as usize].pagecnt;
                }
                o += SLOT_SIZE;
                slotno += 1;
            }
        }
        used.sort_by_key(|&i| {
            let s = &slots[i as usize];
            (s.startpage, s.pagecnt)
        });

        // chain the used slots between the sentinels
        slots[0].pagecnt = slotnpages;
        let mut lastslot = 0u32;
        for &i in &used {
            let (lastend, last_no) = {
                let l = &slots[lastslot as usize];
                (l.startpage + l.pagecnt, l.slotno)
            };
            if lastend > slots[i as usize].startpage {
                self.mapped = None;
                return Err(corrupt(format!("{}: overlapping blobs", self.path)));
            }
            slots[lastslot as usize].next = i;
            slots[i as usize].prev = last_no;
            lastslot = i;
        }
        let filepages = (filelen / pagesize as u64) as u32;
        {
            let lastend = {
                let l = &slots[lastslot as usize];
                l.startpage + l.pagecnt
            };
            if lastend > filepages {
                self.mapped = None;
                return Err(corrupt(format!("{}: blob beyond end of file", self.path)));
            }
        }
        slots[lastslot as usize].next = nslots;
        let tail = &mut slots[nslots as usize];
        tail.slotno = nslots;
        tail.prev = lastslot;
        tail.startpage = filepages;

        // reconcile with the previous slot metadata: hand mappings over or
        // tear them down, telling the clients what happened
        let old = std::mem::take(&mut self.slots);
        for mut oldslot in old.into_iter() {
            let i = oldslot.slotno;
            if i == 0 || i >= self.nslots {
                continue;
            }
            if oldslot.startpage == 0
                || (oldslot.mapping.is_none() && oldslot.client.is_none())
            {
                continue;
            }
            let gone = i >= nslots || {
                let n = &slots[i as usize];
                n.startpage == 0
                    || n.blobtag != oldslot.blobtag
                    || n.subtag != oldslot.subtag
            };
            if gone {
                if oldslot.mapping.take().is_some() {
                    if let Some(client) = &oldslot.client {
                        client.map_changed(None);
                    }
                }
                continue;
            }
            let moved = {
                let n = &slots[i as usize];
                n.startpage != oldslot.startpage || n.pagecnt != oldslot.pagecnt
            };
            let nslot = &mut slots[i as usize];
            if oldslot.client.is_some() {
                nslot.map_writable = oldslot.map_writable;
                nslot.client = oldslot.client.take();
            }
            if moved {
                oldslot.mapping = None;
                if nslot.client.is_some() {
                    if nslot.pagecnt != 0 {
                        nslot.mapping = Mapping::new(
                            &self.file,
                            nslot.startpage as u64 * pagesize as u64,
                            nslot.pagecnt as usize * pagesize as usize,
                            nslot.map_writable,
                        )
                        .ok();
                        let view = nslot.mapping.as_ref().map(|m| m.view());
                        let client = nslot.client.clone().expect("client present");
                        client.map_changed(view);
                    } else {
                        let client = nslot.client.clone().expect("client present");
                        client.map_changed(None);
                    }
                }
            } else {
                nslot.mapping = oldslot.mapping.take();
            }
        }

        self.slots = slots;
        self.nslots = nslots;
        self.generation = generation;
        self.slotnpages = slotnpages;
        self.usergeneration = usergeneration;
        self.usedblobpages = usedblobpages;
        self.firstfree = firstfree;
        Ok(())
    }

    fn write_header(&mut self) {
        let view = self.mapped.as_ref().expect("header not mapped").view();
        view.put_u32(OFFSET_MAGIC, XDB_MAGIC);
        view.put_u32(OFFSET_VERSION, XDB_VERSION);
        view.put_u32(OFFSET_GENERATION, self.generation);
        view.put_u32(OFFSET_SLOTNPAGES, self.slotnpages);
        view.put_u32(OFFSET_PAGESIZE, self.pagesize);
        view.put_u32(OFFSET_USERGENERATION, self.usergeneration);
    }

    /// Write one slot entry back and bump the generation.
    fn update_slot(&mut self, id: u32) {
        let view = self.mapped.as_ref().expect("header not mapped").view();
        let slot = &self.slots[id as usize];
        let base = (SLOT_START - 1 + slot.slotno) as usize * SLOT_SIZE;
        view.put_u32(base, SLOT_MAGIC | (slot.subtag << 24));
        view.put_u32(base + 4, slot.blobtag);
        if slot.pagecnt != 0 || slot.startpage == 0 {
            view.put_u32(base + 8, slot.startpage);
        } else {
            view.put_u32(base + 8, 1); // "empty but allocated" blobs start at 1
        }
        view.put_u32(base + 12, slot.pagecnt);
        self.generation = self.generation.wrapping_add(1);
        view.put_u32(OFFSET_GENERATION, self.generation);
    }

    fn write_empty_pages(&mut self, pageno: u32, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let page = vec![0u8; self.pagesize as usize];
        for p in pageno..pageno + count {
            self.file
                .write_all_at(&page, p as u64 * self.pagesize as u64)?;
        }
        Ok(())
    }

    /// Write a fresh page of free slot entries; for page 0 the header goes
    /// into the same page.
    fn write_empty_slotpage(&mut self, pageno: u32) -> Result<()> {
        let mut page = vec![0u8; self.pagesize as usize];
        let spp = self.pagesize as usize / SLOT_SIZE;
        let first = if pageno == 0 { SLOT_START as usize } else { 0 };
        for i in first..spp {
            LittleEndian::write_u32(&mut page[i * SLOT_SIZE..], SLOT_MAGIC);
        }
        if pageno == 0 {
            LittleEndian::write_u32(&mut page[OFFSET_MAGIC..], XDB_MAGIC);
            LittleEndian::write_u32(&mut page[OFFSET_VERSION..], XDB_VERSION);
            LittleEndian::write_u32(&mut page[OFFSET_GENERATION..], self.generation);
            LittleEndian::write_u32(&mut page[OFFSET_SLOTNPAGES..], self.slotnpages);
            LittleEndian::write_u32(&mut page[OFFSET_PAGESIZE..], self.pagesize);
            LittleEndian::write_u32(&mut page[OFFSET_USERGENERATION..], self.usergeneration);
        }
        self.file
            .write_all_at(&page, pageno as u64 * self.pagesize as u64)?;
        Ok(())
    }

    fn init(&mut self) -> Result<()> {
        self.lock_only(true)?;
        let rc = self.init_internal();
        let _ = self.unlock(true);
        rc
    }

    fn init_internal(&mut self) -> Result<()> {
        if self.file.metadata()?.len() != 0 {
            return Ok(());
        }
        self.slotnpages = 1;
        self.generation = self.generation.wrapping_add(1);
        self.pagesize = XDB_PAGE_SIZE;
        self.write_empty_slotpage(0)
    }

    /*** Blob movement ***/

    fn copy_pages(&mut self, from: u32, to: u32, count: u32) -> Result<()> {
        let mut buf = vec![0u8; 65536];
        let mut src = from as u64 * self.pagesize as u64;
        let mut dst = to as u64 * self.pagesize as u64;
        let mut left = count as u64 * self.pagesize as u64;
        while left > 0 {
            let chunk = left.min(buf.len() as u64) as usize;
            self.file.read_exact_at(&mut buf[..chunk], src)?;
            self.file.write_all_at(&buf[..chunk], dst)?;
            src += chunk as u64;
            dst += chunk as u64;
            left -= chunk as u64;
        }
        Ok(())
    }

    fn map_slot(&mut self, id: u32) -> Result<()> {
        let (startpage, pagecnt, writable) = {
            let s = &self.slots[id as usize];
            (s.startpage, s.pagecnt, s.map_writable)
        };
        let mapping = Mapping::new(
            &self.file,
            startpage as u64 * self.pagesize as u64,
            pagecnt as usize * self.pagesize as usize,
            writable,
        )?;
        self.slots[id as usize].mapping = Some(mapping);
        Ok(())
    }

    fn fire_callback(&self, id: u32) {
        let slot = &self.slots[id as usize];
        if let Some(client) = &slot.client {
            client.map_changed(slot.mapping.as_ref().map(|m| m.view()));
        }
    }

    /// Move (and possibly resize) the blob of `oldid` into the gap after
    /// `afterid`. Content is preserved up to the smaller of the two sizes,
    /// grown space is zero-filled.
    fn move_blob_to(&mut self, oldid: u32, afterid: u32, newpagecnt: u32) -> Result<()> {
        let newstartpage = {
            let a = &self.slots[afterid as usize];
            a.startpage + a.pagecnt
        };
        let nextid = self.slots[afterid as usize].next;
        if newpagecnt > self.slots[nextid as usize].startpage - newstartpage {
            return Err(corrupt(format!("{}: target gap too small", self.path)));
        }
        let (oldstartpage, oldpagecnt) = {
            let s = &self.slots[oldid as usize];
            (s.startpage, s.pagecnt)
        };
        let tocopy = newpagecnt.min(oldpagecnt);
        if tocopy > 0 {
            self.copy_pages(oldstartpage, newstartpage, tocopy)?;
        }
        if newpagecnt > oldpagecnt {
            self.write_empty_pages(newstartpage + oldpagecnt, newpagecnt - oldpagecnt)?;
        }
        self.slots[oldid as usize].mapping = None;
        {
            let slot = &mut self.slots[oldid as usize];
            slot.startpage = newstartpage;
            slot.pagecnt = newpagecnt;
        }
        self.update_slot(oldid);
        self.usedblobpages -= oldpagecnt;
        self.usedblobpages += newpagecnt;

        if afterid != oldid && nextid != oldid {
            // unlink from the old position
            let (oprev, onext) = {
                let s = &self.slots[oldid as usize];
                (s.prev, s.next)
            };
            self.slots[oprev as usize].next = onext;
            self.slots[onext as usize].prev = oprev;
            // chain in between afterslot and nextslot
            self.slots[oldid as usize].prev = afterid;
            self.slots[afterid as usize].next = oldid;
            self.slots[oldid as usize].next = nextid;
            self.slots[nextid as usize].prev = oldid;
        }

        if self.slots[oldid as usize].client.is_some() {
            if newpagecnt != 0 {
                // there is no good way to recover from a failing map here;
                // the client is told either way
                let _ = self.map_slot(oldid);
            }
            self.fire_callback(oldid);
        }
        Ok(())
    }

    /// Move the blob to the first gap that can take `newpagecnt` pages,
    /// growing the file when nothing fits.
    fn move_blob(&mut self, oldid: u32, newpagecnt: u32) -> Result<()> {
        let nslots = self.nslots;
        let mut lastid = 0u32;
        let mut i = self.slots[0].next;
        loop {
            let freecnt = {
                let last = &self.slots[lastid as usize];
                self.slots[i as usize].startpage - (last.startpage + last.pagecnt)
            };
            if freecnt >= newpagecnt {
                break;
            }
            if i == nslots {
                // grow the file
                self.write_empty_pages(
                    self.slots[i as usize].startpage,
                    newpagecnt - freecnt,
                )?;
                self.slots[i as usize].startpage += newpagecnt - freecnt;
                break;
            }
            lastid = i;
            i = self.slots[i as usize].next;
        }
        self.move_blob_to(oldid, lastid, newpagecnt)
    }

    /// Pull the last two blobs of the file into the free area after
    /// `afterid`, biggest first, where they fit.
    fn move_blobs_to_front(&mut self, afterid: u32) -> Result<()> {
        let mut afterid = afterid;
        let mut freestart = {
            let a = &self.slots[afterid as usize];
            a.startpage + a.pagecnt
        };
        let mut freecount = self.slots[self.slots[afterid as usize].next as usize].startpage
            - freestart;

        let slot1 = self.slots[self.nslots as usize].prev;
        if slot1 == 0 {
            return Ok(());
        }
        let slot2 = self.slots[slot1 as usize].prev;
        let (first, second) = if slot2 != 0
            && self.slots[slot1 as usize].pagecnt < self.slots[slot2 as usize].pagecnt
        {
            (slot2, Some(slot1))
        } else {
            (slot1, if slot2 != 0 { Some(slot2) } else { None })
        };
        {
            let s = &self.slots[first as usize];
            if s.pagecnt != 0 && s.pagecnt <= freecount && s.startpage > freestart {
                let cnt = s.pagecnt;
                self.move_blob_to(first, afterid, cnt)?;
                freestart += cnt;
                freecount -= cnt;
                afterid = first;
            }
        }
        if let Some(second) = second {
            let s = &self.slots[second as usize];
            if s.pagecnt != 0 && s.pagecnt <= freecount && s.startpage > freestart {
                let cnt = s.pagecnt;
                self.move_blob_to(second, afterid, cnt)?;
            }
        }
        Ok(())
    }

    /// Extend the slot area by one page, relocating the blob that sits at
    /// its boundary first.
    fn add_slot_page(&mut self) -> Result<()> {
        if self.firstfree != 0 {
            return Err(corrupt(format!("{}: free slots left", self.path)));
        }
        let nslots = self.nslots;

        // move the first real blob if it is in the way
        let mut i = self.slots[0].next;
        while i != nslots && self.slots[i as usize].pagecnt == 0 {
            i = self.slots[i as usize].next;
        }
        if i != nslots
            && self.slots[i as usize].pagecnt != 0
            && self.slots[i as usize].startpage == self.slotnpages
        {
            let pagecnt = self.slots[i as usize].pagecnt;
            self.move_blob(i, pagecnt)?;
        }

        let spp = self.pagesize / SLOT_SIZE as u32;
        self.slots
            .resize_with((nslots + 1 + spp) as usize, XdbSlot::default);

        self.write_empty_slotpage(self.slotnpages)?;

        // remap the header to cover the new page
        self.mapped = None;
        self.map_header(self.slotnpages + 1, self.mapped_rw)?;

        self.slotnpages += 1;
        self.generation = self.generation.wrapping_add(1);
        self.write_header();

        // empty but allocated blobs are parked at the first post-slot page,
        // which just moved up
        let mut i = self.slots[0].next;
        while i != nslots {
            if self.slots[i as usize].startpage >= self.slotnpages {
                break;
            }
            assert_eq!(self.slots[i as usize].pagecnt, 0);
            self.slots[i as usize].startpage = self.slotnpages;
            i = self.slots[i as usize].next;
        }

        // move the tail sentinel to the new end of the array
        let newtail = nslots + spp;
        self.slots[newtail as usize] = std::mem::take(&mut self.slots[nslots as usize]);
        self.slots[newtail as usize].slotno = newtail;
        let tailprev = self.slots[newtail as usize].prev;
        self.slots[tailprev as usize].next = newtail;

        self.nslots += spp;
        self.slots[0].pagecnt += 1;

        // the freed range becomes fresh free slots
        for i in nslots..newtail {
            let slot = &mut self.slots[i as usize];
            *slot = XdbSlot::default();
            slot.slotno = i;
            slot.next = if i + 1 < newtail { i + 1 } else { 0 };
        }
        self.firstfree = nslots;
        Ok(())
    }

    fn create_blob(&mut self, blobtag: u32, subtag: u32) -> Result<u32> {
        if subtag > 255 {
            return Err(Error::InvalidArg("subtag does not fit in one byte"));
        }
        if self.firstfree == 0 {
            self.add_slot_page()?;
        }
        let id = self.firstfree;
        self.firstfree = self.slots[id as usize].next;
        {
            let slot = &mut self.slots[id as usize];
            slot.mapping = None;
            slot.client = None;
            slot.blobtag = blobtag;
            slot.subtag = subtag;
            slot.startpage = self.slotnpages;
            slot.pagecnt = 0;
        }
        self.update_slot(id);
        // enqueue at the head of the used chain
        let next = self.slots[0].next;
        self.slots[id as usize].prev = 0;
        self.slots[id as usize].next = next;
        self.slots[next as usize].prev = id;
        self.slots[0].next = id;
        Ok(id)
    }

    fn find_blob(&self, blobtag: u32, subtag: u32) -> u32 {
        let mut i = self.slots[0].next;
        while i != self.nslots {
            let slot = &self.slots[i as usize];
            if slot.blobtag == blobtag && slot.subtag == subtag {
                return i;
            }
            i = slot.next;
        }
        0
    }

    /*** Public blob operations ***/

    /// Find the blob identified by `(blobtag, subtag)`. With `create`, a
    /// missing blob is allocated empty; with `truncate`, an existing blob
    /// is resized to zero first.
    pub fn lookup_blob(
        &mut self,
        blobtag: u32,
        subtag: u32,
        create: bool,
        truncate: bool,
    ) -> Result<u32> {
        let excl = create || truncate;
        self.lock_read_header(excl)?;
        let rc = (|| {
            let mut id = self.find_blob(blobtag, subtag);
            if id != 0 && truncate {
                self.resize_internal(id, 0)?;
            }
            if id == 0 && create {
                id = self.create_blob(blobtag, subtag)?;
            }
            if id == 0 {
                Err(Error::NotFound)
            } else {
                Ok(id)
            }
        })();
        let _ = self.unlock(excl);
        rc
    }

    /// Destroy a blob. The freed pages are handed back by compacting the
    /// tail of the file when worthwhile.
    pub fn del_blob(&mut self, id: u32) -> Result<()> {
        if id == 0 {
            return Err(Error::InvalidArg("blob id must be nonzero"));
        }
        self.lock_read_header(true)?;
        let rc = self.del_blob_internal(id);
        let _ = self.unlock(true);
        rc
    }

    fn del_blob_internal(&mut self, id: u32) -> Result<()> {
        if id >= self.nslots {
            return Err(Error::InvalidArg("blob id out of range"));
        }
        if self.slots[id as usize].startpage == 0 {
            return Ok(());
        }
        if self.slots[id as usize].mapping.take().is_some() {
            self.fire_callback(id);
        }
        self.slots[id as usize].client = None;

        // unlink from the used chain
        let (prev, next, startpage, pagecnt) = {
            let s = &self.slots[id as usize];
            (s.prev, s.next, s.startpage, s.pagecnt)
        };
        self.slots[prev as usize].next = next;
        self.slots[next as usize].prev = prev;
        self.usedblobpages -= pagecnt;

        let filepages = self.slots[self.nslots as usize].startpage;
        if self.usedblobpages * 2 < filepages && (startpage + pagecnt) * 2 < filepages {
            // freed in the first half of the file, move the last two blobs
            // down if we can
            self.move_blobs_to_front(prev)?;
        }

        // clear the slot and put it on the free chain
        let slotno = self.slots[id as usize].slotno;
        self.slots[id as usize] = XdbSlot::default();
        self.slots[id as usize].slotno = slotno;
        self.update_slot(id);
        self.slots[id as usize].next = self.firstfree;
        self.firstfree = id;

        // truncate the file if the tail went mostly free
        let lastid = self.slots[self.nslots as usize].prev;
        let lastend = {
            let s = &self.slots[lastid as usize];
            s.startpage + s.pagecnt
        };
        if lastend < self.slots[self.nslots as usize].startpage / 4 * 3
            && self
                .file
                .set_len(lastend as u64 * self.pagesize as u64)
                .is_ok()
        {
            self.slots[self.nslots as usize].startpage = lastend;
        }
        Ok(())
    }

    /// Destroy every blob and reset the file to a single slot page. Client
    /// mappings are torn down first.
    pub fn del_all_blobs(&mut self) -> Result<()> {
        self.lock_only(true)?;
        let rc = (|| {
            for i in 1..self.nslots {
                let had_mapping = {
                    let slot = &mut self.slots[i as usize];
                    slot.startpage != 0 && slot.mapping.take().is_some()
                };
                if had_mapping {
                    self.fire_callback(i);
                }
            }
            self.slots = Vec::new();
            self.nslots = 0;
            self.mapped = None;
            let (generation, _, pagesize, usergeneration) = self.read_header_raw()?;
            self.generation = generation.wrapping_add(1);
            self.slotnpages = 1;
            self.pagesize = pagesize;
            self.usergeneration = usergeneration;
            self.write_empty_slotpage(0)?;
            // shrinking is best-effort; a stale tail is reclaimed later
            let _ = self.file.set_len(self.pagesize as u64);
            Ok(())
        })();
        let _ = self.unlock(true);
        rc
    }

    /// Grow, shrink or relocate a blob. Content is preserved up to the
    /// smaller of the old and new size; grown space reads as zero.
    pub fn resize_blob(&mut self, id: u32, newsize: usize) -> Result<()> {
        if id == 0 {
            return Err(Error::InvalidArg("blob id must be nonzero"));
        }
        self.lock_read_header(true)?;
        let rc = self.resize_internal(id, newsize);
        let _ = self.unlock(true);
        rc
    }

    fn resize_internal(&mut self, id: u32, newsize: usize) -> Result<()> {
        if id >= self.nslots {
            return Err(Error::InvalidArg("blob id out of range"));
        }
        if self.slots[id as usize].startpage == 0 {
            return Err(Error::InvalidArg("blob id is not allocated"));
        }
        let pagesize = self.pagesize as usize;
        let oldpagecnt = self.slots[id as usize].pagecnt;
        let newpagecnt = ((newsize + pagesize - 1) / pagesize) as u32;
        if oldpagecnt != 0 && newpagecnt != 0 && newpagecnt <= oldpagecnt {
            // shrinking: zero the now-unused end of the last page
            let pg = newsize & (pagesize - 1);
            if pg != 0 {
                let startpage = self.slots[id as usize].startpage;
                if let Some(mapping) = &self.slots[id as usize].mapping {
                    mapping
                        .view()
                        .fill_zero((newpagecnt as usize - 1) * pagesize + pg, pagesize - pg);
                } else {
                    let zeros = vec![0u8; pagesize - pg];
                    self.file.write_all_at(
                        &zeros,
                        (startpage + newpagecnt - 1) as u64 * pagesize as u64 + pg as u64,
                    )?;
                }
            }
        }
        if newpagecnt == oldpagecnt {
            return Ok(());
        }
        if newpagecnt == 0 {
            // shrink to an empty but still allocated blob
            self.slots[id as usize].mapping = None;
            let (prev, next) = {
                let slot = &mut self.slots[id as usize];
                slot.pagecnt = 0;
                slot.startpage = self.slotnpages;
                (slot.prev, slot.next)
            };
            self.slots[prev as usize].next = next;
            self.slots[next as usize].prev = prev;
            let head_next = self.slots[0].next;
            self.slots[id as usize].prev = 0;
            self.slots[id as usize].next = head_next;
            self.slots[head_next as usize].prev = id;
            self.slots[0].next = id;
            self.update_slot(id);
            self.usedblobpages -= oldpagecnt;
            self.fire_callback(id);
        } else if newpagecnt
            <= self.slots[self.slots[id as usize].next as usize].startpage
                - self.slots[id as usize].startpage
        {
            // resize in place
            if newpagecnt > oldpagecnt {
                let startpage = self.slots[id as usize].startpage;
                self.write_empty_pages(startpage + oldpagecnt, newpagecnt - oldpagecnt)?;
            }
            self.slots[id as usize].pagecnt = newpagecnt;
            if self.slots[id as usize].client.is_some() {
                self.slots[id as usize].mapping = None;
                self.map_slot(id)?;
            } else {
                self.slots[id as usize].mapping = None;
            }
            self.update_slot(id);
            self.usedblobpages -= oldpagecnt;
            self.usedblobpages += newpagecnt;
            if self.slots[id as usize].client.is_some() {
                self.fire_callback(id);
            }
        } else {
            // no room, relocate
            self.move_blob(id, newpagecnt)?;
        }
        Ok(())
    }

    /// Map a blob and register `client` for relocation events. The client
    /// is called once right away with the current window, then again on
    /// every move, resize, unmap or delete.
    pub fn map_blob(
        &mut self,
        id: u32,
        writable: bool,
        client: Rc<dyn BlobMapClient>,
    ) -> Result<()> {
        if id == 0 {
            return Err(Error::InvalidArg("blob id must be nonzero"));
        }
        if writable && self.rdonly {
            return Err(Error::ReadOnly);
        }
        self.lock(false)?;
        let rc = (|| {
            if id >= self.nslots {
                return Err(Error::InvalidArg("blob id out of range"));
            }
            if self.slots[id as usize].startpage == 0
                || self.slots[id as usize].mapping.is_some()
            {
                return Err(Error::InvalidArg("blob id is not mappable"));
            }
            self.slots[id as usize].map_writable = writable;
            if self.slots[id as usize].pagecnt != 0 {
                if let Err(e) = self.map_slot(id) {
                    self.slots[id as usize].map_writable = false;
                    return Err(e);
                }
            }
            self.slots[id as usize].client = Some(client);
            self.fire_callback(id);
            Ok(())
        })();
        let _ = self.unlock(false);
        rc
    }

    /// Drop a blob's mapping and unregister its client. The client gets a
    /// final `None` callback if a mapping was open.
    pub fn unmap_blob(&mut self, id: u32) -> Result<()> {
        if id == 0 {
            return Ok(());
        }
        self.lock(false)?;
        let rc = (|| {
            if id >= self.nslots {
                return Err(Error::InvalidArg("blob id out of range"));
            }
            if self.slots[id as usize].mapping.take().is_some() {
                self.fire_callback(id);
            }
            let slot = &mut self.slots[id as usize];
            slot.client = None;
            slot.map_writable = false;
            Ok(())
        })();
        let _ = self.unlock(false);
        rc
    }

    /// Give a blob a new (tag, subtag) address, replacing any blob already
    /// there. Returns the blob's id, which changes when a replacement took
    /// place (the replaced blob's slot is reused so the address keeps its
    /// slot number).
    pub fn rename_blob(&mut self, id: u32, blobtag: u32, subtag: u32) -> Result<u32> {
        if id == 0 {
            return Err(Error::InvalidArg("blob id must be nonzero"));
        }
        if subtag > 255 {
            return Err(Error::InvalidArg("subtag does not fit in one byte"));
        }
        self.lock_read_header(true)?;
        let rc = self.rename_internal(id, blobtag, subtag);
        let _ = self.unlock(true);
        rc
    }

    fn rename_internal(&mut self, id: u32, blobtag: u32, subtag: u32) -> Result<u32> {
        if id >= self.nslots {
            return Err(Error::InvalidArg("blob id out of range"));
        }
        if self.slots[id as usize].startpage == 0 {
            return Err(Error::InvalidArg("blob id is not allocated"));
        }
        if self.slots[id as usize].blobtag == blobtag
            && self.slots[id as usize].subtag == subtag
        {
            return Ok(id);
        }
        let otherid = self.find_blob(blobtag, subtag);
        if otherid != 0 {
            self.del_blob_internal(otherid)?;
            // the freed slot must be the head of the free chain; reuse it so
            // the renamed blob takes over the old address's slot number
            if self.firstfree != otherid {
                return Err(corrupt(format!("{}: free chain inconsistent", self.path)));
            }
            self.firstfree = self.slots[otherid as usize].next;

            let mut slot = std::mem::take(&mut self.slots[id as usize]);
            slot.blobtag = blobtag;
            slot.subtag = subtag;
            slot.slotno = otherid;
            let (prev, next) = (slot.prev, slot.next);
            self.slots[otherid as usize] = slot;
            self.slots[prev as usize].next = otherid;
            self.slots[next as usize].prev = otherid;
            self.update_slot(otherid);

            self.slots[id as usize].slotno = id;
            self.update_slot(id);
            self.slots[id as usize].next = self.firstfree;
            self.firstfree = id;
            Ok(otherid)
        } else {
            let slot = &mut self.slots[id as usize];
            slot.blobtag = blobtag;
            slot.subtag = subtag;
            self.update_slot(id);
            Ok(id)
        }
    }

    /*** User generation ***/

    /// Store an opaque consistency marker, syncing blob contents to disk
    /// first so the marker never gets ahead of the data it describes.
    pub fn set_user_generation(&mut self, usergeneration: u32) -> Result<()> {
        self.lock_read_header(true)?;
        let rc = (|| {
            if self.dofsync {
                self.file.sync_data()?;
            }
            self.usergeneration = usergeneration;
            self.generation = self.generation.wrapping_add(1);
            self.write_header();
            Ok(())
        })();
        let _ = self.unlock(true);
        rc
    }

    pub fn get_user_generation(&mut self) -> Result<u32> {
        self.lock_read_header(false)?;
        let usergeneration = self.usergeneration;
        let _ = self.unlock(false);
        Ok(usergeneration)
    }

    pub fn stats(&mut self) -> Result<XdbStats> {
        self.lock_read_header(false)?;
        let filepages = self.slots[self.nslots as usize].startpage;
        let mut blobs = Vec::new();
        for i in 1..self.nslots {
            let slot = &self.slots[i as usize];
            if slot.startpage == 0 {
                continue;
            }
            blobs.push(XdbBlobInfo {
                id: i,
                blobtag: slot.blobtag,
                subtag: slot.subtag,
                startpage: slot.startpage,
                pagecnt: slot.pagecnt,
                mapped: slot.client.is_some(),
            });
        }
        let stats = XdbStats {
            path: self.path.clone(),
            generation: self.generation,
            slot_pages: self.slotnpages,
            blob_pages: self.usedblobpages,
            free_pages: filepages - self.usedblobpages - self.slotnpages,
            pagesize: self.pagesize,
            blobs,
        };
        let _ = self.unlock(false);
        Ok(stats)
    }
}

impl Drop for Xdb {
    fn drop(&mut self) {
        for i in 1..self.nslots {
            let slot = &mut self.slots[i as usize];
            if slot.mapping.take().is_some() {
                if let Some(client) = &slot.client {
                    client.map_changed(None);
                }
            }
        }
        debug!("closed blob store {}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    use camino_tempfile::Utf8TempDir;

    struct TestClient {
        view: Cell<Option<BlobView>>,
    }

    impl TestClient {
        fn new() -> Rc<TestClient> {
            Rc::new(TestClient {
                view: Cell::new(None),
            })
        }
    }

    impl BlobMapClient for TestClient {
        fn map_changed(&self, view: Option<BlobView>) {
            self.view.set(view);
        }
    }

    fn open_pair(dir: &Utf8TempDir) -> (Rc<RefCell<PkgDb>>, Xdb) {
        let pkgdb = Rc::new(RefCell::new(
            PkgDb::open(&dir.path().join("Packages.db"), true, false).unwrap(),
        ));
        let xdb = Xdb::open(pkgdb.clone(), &dir.path().join("Index.db"), true, false).unwrap();
        (pkgdb, xdb)
    }

    fn check_linkage(xdb: &Xdb) {
        // walking from slot 0 visits every used slot exactly once, in
        // strictly ascending startpage order
        let mut seen = 0;
        let mut lastend = 0;
        let mut i = xdb.slots[0].next;
        while i != xdb.nslots {
            let s = &xdb.slots[i as usize];
            assert!(s.startpage >= lastend);
            assert!(s.startpage != 0);
            lastend = s.startpage + s.pagecnt;
            seen += 1;
            i = s.next;
            assert!(seen <= xdb.nslots, "cycle in slot chain");
        }
        let used = (1..xdb.nslots)
            .filter(|&i| xdb.slots[i as usize].startpage != 0)
            .count();
        assert_eq!(seen, used as u32);
    }

    #[test]
    fn create_and_lookup() {
        let dir = Utf8TempDir::new().unwrap();
        let (_pkgdb, mut xdb) = open_pair(&dir);
        assert!(matches!(
            xdb.lookup_blob(100, 0, false, false),
            Err(Error::NotFound)
        ));
        let id = xdb.lookup_blob(100, 0, true, false).unwrap();
        assert!(id != 0);
        assert_eq!(xdb.lookup_blob(100, 0, false, false).unwrap(), id);
        let other = xdb.lookup_blob(100, 1, true, false).unwrap();
        assert_ne!(other, id);
        check_linkage(&xdb);
    }

    #[test]
    fn empty_blob_startpage_is_one_on_disk() {
        let dir = Utf8TempDir::new().unwrap();
        let (_pkgdb, mut xdb) = open_pair(&dir);
        let id = xdb.lookup_blob(42, 7, true, false).unwrap();
        drop(xdb);
        let contents = std::fs::read(dir.path().join("Index.db")).unwrap();
        let base = (SLOT_START - 1 + id) as usize * SLOT_SIZE;
        let w = u32::from_le_bytes(contents[base..base + 4].try_into().unwrap());
        assert_eq!(w & 0x00ff_ffff, SLOT_MAGIC);
        assert_eq!(w >> 24, 7);
        assert_eq!(
            u32::from_le_bytes(contents[base + 8..base + 12].try_into().unwrap()),
            1
        );
        assert_eq!(
            u32::from_le_bytes(contents[base + 12..base + 16].try_into().unwrap()),
            0
        );
    }

    #[test]
    fn resize_and_map() {
        let dir = Utf8TempDir::new().unwrap();
        let (_pkgdb, mut xdb) = open_pair(&dir);
        let id = xdb.lookup_blob(1, 0, true, false).unwrap();
        xdb.resize_blob(id, 2 * XDB_PAGE_SIZE as usize).unwrap();
        let client = TestClient::new();
        xdb.map_blob(id, true, client.clone()).unwrap();
        let view = client.view.get().expect("mapped view");
        assert_eq!(view.len(), 2 * XDB_PAGE_SIZE as usize);
        view.put_u32(0, 0x11111111);
        view.put_u32(XDB_PAGE_SIZE as usize, 0x22222222);
        // growing the last blob relocates it past the current end of file;
        // the client must get a fresh window either way
        xdb.resize_blob(id, 3 * XDB_PAGE_SIZE as usize).unwrap();
        let view = client.view.get().expect("mapped view");
        assert_eq!(view.len(), 3 * XDB_PAGE_SIZE as usize);
        assert_eq!(view.get_u32(0), 0x11111111);
        assert_eq!(view.get_u32(XDB_PAGE_SIZE as usize), 0x22222222);
        assert_eq!(view.get_u32(2 * XDB_PAGE_SIZE as usize), 0);
        xdb.unmap_blob(id).unwrap();
        assert!(client.view.get().is_none());
    }

    #[test]
    fn relocation_preserves_content() {
        let dir = Utf8TempDir::new().unwrap();
        let (_pkgdb, mut xdb) = open_pair(&dir);
        let a = xdb.lookup_blob(1, 0, true, false).unwrap();
        xdb.resize_blob(a, XDB_PAGE_SIZE as usize).unwrap();
        let b = xdb.lookup_blob(2, 0, true, false).unwrap();
        xdb.resize_blob(b, XDB_PAGE_SIZE as usize).unwrap();
        let client = TestClient::new();
        xdb.map_blob(a, true, client.clone()).unwrap();
        client.view.get().unwrap().put_u32(100, 0xabcdef01);
        // blob b sits right after blob a, so growing a forces a relocation
        xdb.resize_blob(a, 4 * XDB_PAGE_SIZE as usize).unwrap();
        let view = client.view.get().expect("remapped view");
        assert_eq!(view.len(), 4 * XDB_PAGE_SIZE as usize);
        assert_eq!(view.get_u32(100), 0xabcdef01);
        check_linkage(&xdb);
    }

    #[test]
    fn del_blob_tears_down_mapping() {
        let dir = Utf8TempDir::new().unwrap();
        let (_pkgdb, mut xdb) = open_pair(&dir);
        let id = xdb.lookup_blob(5, 0, true, false).unwrap();
        xdb.resize_blob(id, 1000).unwrap();
        let client = TestClient::new();
        xdb.map_blob(id, false, client.clone()).unwrap();
        assert!(client.view.get().is_some());
        xdb.del_blob(id).unwrap();
        assert!(client.view.get().is_none());
        assert!(matches!(
            xdb.lookup_blob(5, 0, false, false),
            Err(Error::NotFound)
        ));
        // deleting twice is fine, the slot is just free
        xdb.del_blob(id).unwrap();
        check_linkage(&xdb);
    }

    #[test]
    fn del_truncates_tail() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("Index.db");
        let (_pkgdb, mut xdb) = open_pair(&dir);
        let a = xdb.lookup_blob(1, 0, true, false).unwrap();
        xdb.resize_blob(a, 8 * XDB_PAGE_SIZE as usize).unwrap();
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            9 * XDB_PAGE_SIZE as u64
        );
        xdb.del_blob(a).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), XDB_PAGE_SIZE as u64);
    }

    #[test]
    fn del_all_blobs_resets() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("Index.db");
        let (_pkgdb, mut xdb) = open_pair(&dir);
        for tag in 1..5 {
            let id = xdb.lookup_blob(tag, 0, true, false).unwrap();
            xdb.resize_blob(id, 3000).unwrap();
        }
        xdb.set_user_generation(77).unwrap();
        xdb.del_all_blobs().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), XDB_PAGE_SIZE as u64);
        for tag in 1..5 {
            assert!(matches!(
                xdb.lookup_blob(tag, 0, false, false),
                Err(Error::NotFound)
            ));
        }
        // the user generation survives the reset
        assert_eq!(xdb.get_user_generation().unwrap(), 77);
    }

    #[test]
    fn rename_and_replace() {
        let dir = Utf8TempDir::new().unwrap();
        let (_pkgdb, mut xdb) = open_pair(&dir);
        let a = xdb.lookup_blob(1, 0, true, false).unwrap();
        xdb.resize_blob(a, 100).unwrap();
        let a = xdb.rename_blob(a, 1, 9).unwrap();
        assert_eq!(xdb.lookup_blob(1, 9, false, false).unwrap(), a);
        assert!(matches!(
            xdb.lookup_blob(1, 0, false, false),
            Err(Error::NotFound)
        ));
        // renaming over an existing address replaces it
        let b = xdb.lookup_blob(1, 0, true, false).unwrap();
        xdb.resize_blob(b, 200).unwrap();
        let b2 = xdb.rename_blob(b, 1, 9).unwrap();
        assert_eq!(xdb.lookup_blob(1, 9, false, false).unwrap(), b2);
        check_linkage(&xdb);
    }

    #[test]
    fn user_generation_round_trip() {
        let dir = Utf8TempDir::new().unwrap();
        let (_pkgdb, mut xdb) = open_pair(&dir);
        assert_eq!(xdb.get_user_generation().unwrap(), 0);
        xdb.set_user_generation(123).unwrap();
        assert_eq!(xdb.get_user_generation().unwrap(), 123);
    }

    #[test]
    fn reopen_preserves_blobs() {
        let dir = Utf8TempDir::new().unwrap();
        let (pkgdb, mut xdb) = open_pair(&dir);
        let id = xdb.lookup_blob(3, 0, true, false).unwrap();
        xdb.resize_blob(id, XDB_PAGE_SIZE as usize).unwrap();
        let client = TestClient::new();
        xdb.map_blob(id, true, client.clone()).unwrap();
        client.view.get().unwrap().put_u32(0, 0x5a5a5a5a);
        xdb.unmap_blob(id).unwrap();
        drop(xdb);
        let mut xdb =
            Xdb::open(pkgdb, &dir.path().join("Index.db"), false, false).unwrap();
        let id = xdb.lookup_blob(3, 0, false, false).unwrap();
        let client = TestClient::new();
        xdb.map_blob(id, false, client.clone()).unwrap();
        assert_eq!(client.view.get().unwrap().get_u32(0), 0x5a5a5a5a);
    }

    #[test]
    fn many_blobs_fill_slot_pages() {
        let dir = Utf8TempDir::new().unwrap();
        let (_pkgdb, mut xdb) = open_pair(&dir);
        // more blobs than one slot page can address, forcing addslotpage
        // to relocate whatever sits at the slot area boundary
        let nblobs = 300u32;
        for tag in 1..=nblobs {
            let id = xdb.lookup_blob(tag, 0, true, false).unwrap();
            xdb.resize_blob(id, 17).unwrap();
        }
        check_linkage(&xdb);
        for tag in 1..=nblobs {
            let id = xdb.lookup_blob(tag, 0, false, false).unwrap();
            assert!(id != 0);
        }
        assert!(xdb.slotnpages >= 2);
    }
}
