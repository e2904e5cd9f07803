//!
//! Secondary index engine.
//!
//! One index maps opaque byte-string keys to sets of (package id, tag
//! index) pairs. The whole index lives inside a single sub-blob of the
//! blob store, addressed by (tag, subtag 0), and is accessed through the
//! store's mapping callback so that it survives blob relocations:
//!
//! ```text
//! offset 0    header: magic 'RpmI', version, generation, nslots,
//!             usedslots, dummyslots, xmask, keyend, keyexcess
//! offset 64   nslots 8-byte slots: (keyoff | extra hash bits, data)
//!             nslots 4-byte overflow words
//! then        key heap: vlq-length-prefixed keys, grow-only
//! ```
//!
//! Lookup is open addressing: the key is hashed (murmur variant), the low
//! hash bits pick the start slot and the probe step starts at 7 and grows
//! by one per step. The high hash bits are folded into the stored key
//! offset (`xmask` separates them) and act as a fingerprint that prunes
//! most key-heap accesses on collisions. A slot word of 0 is empty; all
//! ones is a tombstone that stays part of every probe chain crossing it.
//!
//! The (pkgidx, datidx) pair is squeezed into the 32-bit `data` word where
//! possible; the overflow word is used only for large ids, so the common
//! case never touches the overflow array.
//!
//! When the table gets too full, the key heap too holey, or the key heap
//! too large for the offset bits, the index is rebuilt into a sibling
//! sub-blob (subtag 1) and atomically renamed over the canonical one. A
//! crash mid-rebuild leaves the canonical blob untouched and a stray
//! rebuild blob that the next rebuild truncates and reuses.
//!

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::debug;

use crate::error::{Error, Result};
use crate::mmap::{system_page_size, BlobView};
use crate::pkgdb::HASH_CONST;
use crate::xdb::{BlobMapClient, Xdb};

const IDXDB_MAGIC: u32 = u32::from_le_bytes(*b"RpmI");
const IDXDB_VERSION: u32 = 0;

const OFFSET_MAGIC: usize = 0;
const OFFSET_VERSION: usize = 4;
const OFFSET_GENERATION: usize = 8;
const OFFSET_NSLOTS: usize = 12;
const OFFSET_USEDSLOTS: usize = 16;
const OFFSET_DUMMYSLOTS: usize = 20;
const OFFSET_XMASK: usize = 24;
const OFFSET_KEYEND: usize = 28;
const OFFSET_KEYEXCESS: usize = 32;

const SLOT_OFFSET: usize = 64;
const KEY_CHUNKSIZE: usize = 4096;

const DUMMY: u32 = !0;

/// xdb subtags used by the index
const SUBTAG: u32 = 0;
const SUBTAG_REBUILD: u32 = 1;

/// Murmur-derived hash; the constant is shared with the package store's
/// slot hash, and the finalizer defines the on-disk probe layout.
pub(crate) fn murmurhash(s: &[u8]) -> u32 {
    const M: u32 = HASH_CONST;
    let mut h = (s.len() as u32).wrapping_mul(M);
    let mut rest = s;
    while rest.len() >= 4 {
        h = h.wrapping_add(u32::from_le_bytes(rest[..4].try_into().expect("4 bytes")));
        h = h.wrapping_mul(M);
        h ^= h >> 16;
        rest = &rest[4..];
    }
    if !rest.is_empty() {
        if rest.len() == 3 {
            h = h.wrapping_add((rest[2] as u32) << 16);
        }
        if rest.len() >= 2 {
            h = h.wrapping_add((rest[1] as u32) << 8);
        }
        h = h.wrapping_add(rest[0] as u32);
        h = h.wrapping_mul(M);
        h ^= h >> 16;
    }
    h = h.wrapping_mul(M);
    h ^= h >> 10;
    h = h.wrapping_mul(M);
    h ^= h >> 17;
    h
}

/// Squeeze a (pkgidx, datidx) pair into the data word, spilling the
/// package id into the overflow word only when it does not fit.
fn encode_data(pkgidx: u32, datidx: u32) -> (u32, u32) {
    if pkgidx < 0x100000 && datidx < 0x400 {
        (pkgidx | datidx << 20, 0)
    } else if pkgidx < 0x1000000 && datidx < 0x40 {
        (pkgidx | datidx << 24 | 0x4000_0000, 0)
    } else {
        (datidx | 0x8000_0000, pkgidx)
    }
}

fn decode_data(data: u32, ovldata: u32) -> (u32, u32) {
    if data & 0x8000_0000 != 0 {
        (ovldata, data ^ 0x8000_0000)
    } else if data & 0x4000_0000 != 0 {
        (data & 0xff_ffff, (data ^ 0x4000_0000) >> 24)
    } else {
        (data & 0xf_ffff, data >> 20)
    }
}

fn keyl_size(keyl: u32) -> usize {
    if keyl != 0 && keyl < 255 {
        1
    } else if keyl < 65535 {
        3
    } else {
        7
    }
}

fn encode_keyl(buf: &mut [u8], keyl: u32) {
    if keyl != 0 && keyl < 255 {
        buf[0] = keyl as u8;
    } else if keyl < 65535 {
        buf[0] = 255;
        buf[1] = keyl as u8;
        buf[2] = (keyl >> 8) as u8;
    } else {
        buf[0] = 255;
        buf[1] = 255;
        buf[2] = 255;
        buf[3] = keyl as u8;
        buf[4] = (keyl >> 8) as u8;
        buf[5] = (keyl >> 16) as u8;
        buf[6] = (keyl >> 24) as u8;
    }
}

/// Decode a length prefix, or `None` if the buffer ends inside it.
fn decode_keyl(p: &[u8]) -> Option<(u32, usize)> {
    if p.is_empty() {
        None
    } else if p[0] != 255 {
        Some((p[0] as u32, 1))
    } else if p.len() < 3 {
        None
    } else if p[1] != 255 || p[2] != 255 {
        Some((p[1] as u32 | (p[2] as u32) << 8, 3))
    } else if p.len() < 7 {
        None
    } else {
        Some((
            p[3] as u32 | (p[4] as u32) << 8 | (p[5] as u32) << 16 | (p[6] as u32) << 24,
            7,
        ))
    }
}

/// Landing spot for the mapping callback: the blob store drops the new
/// window in here whenever the index blob moves.
#[derive(Default)]
struct MapCell {
    view: Cell<Option<BlobView>>,
}

impl BlobMapClient for MapCell {
    fn map_changed(&self, view: Option<BlobView>) {
        self.view.set(view);
    }
}

/// Summary counters for inspection tools.
#[derive(Debug, Clone)]
pub struct IdxDbStats {
    pub tag: u32,
    pub blob_id: u32,
    pub generation: u32,
    pub nslots: u32,
    pub usedslots: u32,
    pub dummyslots: u32,
    pub keyend: u32,
    pub keyexcess: u32,
    pub xmask: u32,
}

pub struct IdxDb {
    xdb: Rc<RefCell<Xdb>>,
    tag: u32,
    xdbid: u32,
    rdonly: bool,
    map: Rc<MapCell>,
    pagesize: usize,

    generation: u32,
    nslots: u32,
    usedslots: u32,
    dummyslots: u32,
    keyend: u32,
    keyexcess: u32,
    hmask: u32,
    xmask: u32,
}

impl IdxDb {
    /// Open the index stored under `tag`, building an empty one if it does
    /// not exist yet.
    pub fn open(xdb: Rc<RefCell<Xdb>>, tag: u32) -> Result<IdxDb> {
        let rdonly = xdb.borrow().is_rdonly();
        xdb.borrow_mut().lock(false)?;
        let rc = (|| {
            let id = match xdb.borrow_mut().lookup_blob(tag, SUBTAG, false, false) {
                Ok(id) => id,
                Err(Error::NotFound) => 0,
                Err(e) => return Err(e),
            };
            let mut idxdb = IdxDb {
                xdb: xdb.clone(),
                tag,
                xdbid: id,
                rdonly,
                map: Rc::new(MapCell::default()),
                pagesize: system_page_size(),
                generation: 0,
                nslots: 0,
                usedslots: 0,
                dummyslots: 0,
                keyend: 0,
                keyexcess: 0,
                hmask: 0,
                xmask: 0,
            };
            if id == 0 {
                idxdb.init()?;
            }
            debug!("opened index for tag {}", tag);
            Ok(idxdb)
        })();
        let _ = xdb.borrow_mut().unlock(false);
        rc
    }

    /// Remove the whole index stored under `tag`.
    pub fn del_index(xdb: &Rc<RefCell<Xdb>>, tag: u32) -> Result<()> {
        xdb.borrow_mut().lock(true)?;
        let rc = (|| {
            let id = match xdb.borrow_mut().lookup_blob(tag, SUBTAG, false, false) {
                Ok(id) => id,
                Err(Error::NotFound) => 0,
                Err(e) => return Err(e),
            };
            if id != 0 {
                xdb.borrow_mut().del_blob(id)?;
            }
            Ok(())
        })();
        let _ = xdb.borrow_mut().unlock(true);
        rc
    }

    pub fn tag(&self) -> u32 {
        self.tag
    }

    /*** Locking ***/

    fn lock(&mut self, excl: bool) -> Result<()> {
        if excl && self.rdonly {
            return Err(Error::ReadOnly);
        }
        self.xdb.borrow_mut().lock(excl)
    }

    fn unlock(&mut self, excl: bool) -> Result<()> {
        self.xdb.borrow_mut().unlock(excl)
    }

    fn lock_read_header(&mut self, excl: bool) -> Result<()> {
        self.lock(excl)?;
        if let Err(e) = self.read_header() {
            let _ = self.unlock(excl);
            return Err(e);
        }
        Ok(())
    }

    /*** Mapping and header ***/

    /// The current window into the index blob.
    fn v(&self) -> BlobView {
        self.map.view.get().expect("index blob not mapped")
    }

    fn map_blob(&mut self) -> Result<()> {
        self.xdb
            .borrow_mut()
            .map_blob(self.xdbid, !self.rdonly, self.map.clone())?;
        let too_small = match self.map.view.get() {
            Some(view) => view.len() < 4096,
            None => true,
        };
        if too_small {
            let _ = self.xdb.borrow_mut().unmap_blob(self.xdbid);
            return Err(crate::error::corrupt("index blob is truncated"));
        }
        Ok(())
    }

    fn unmap(&mut self) {
        if self.map.view.get().is_some() {
            let _ = self.xdb.borrow_mut().unmap_blob(self.xdbid);
        }
    }

    fn read_header(&mut self) -> Result<()> {
        if let Some(view) = self.map.view.get() {
            if view.get_u32(OFFSET_GENERATION) == self.generation {
                return Ok(());
            }
            self.unmap();
        }
        self.nslots = 0;
        self.map_blob()?;
        let view = self.v();
        if view.get_u32(OFFSET_MAGIC) != IDXDB_MAGIC
            || view.get_u32(OFFSET_VERSION) != IDXDB_VERSION
        {
            self.unmap();
            return Err(crate::error::corrupt("bad index header"));
        }
        self.generation = view.get_u32(OFFSET_GENERATION);
        self.nslots = view.get_u32(OFFSET_NSLOTS);
        self.usedslots = view.get_u32(OFFSET_USEDSLOTS);
        self.dummyslots = view.get_u32(OFFSET_DUMMYSLOTS);
        self.xmask = view.get_u32(OFFSET_XMASK);
        self.keyend = view.get_u32(OFFSET_KEYEND);
        self.keyexcess = view.get_u32(OFFSET_KEYEXCESS);
        if self.nslots == 0 || self.nslots & (self.nslots - 1) != 0 {
            self.unmap();
            return Err(crate::error::corrupt("bad index slot count"));
        }
        self.hmask = self.nslots - 1;
        // only now can the space be split between slots and keys
        if view.len() <= SLOT_OFFSET + self.nslots as usize * 12 {
            self.unmap();
            return Err(crate::error::corrupt("index blob too small for its slots"));
        }
        Ok(())
    }

    /*** Field accessors over the mapping ***/

    fn key_heap_off(&self) -> usize {
        SLOT_OFFSET + self.nslots as usize * 12
    }

    fn key_size(&self) -> usize {
        self.v().len() - self.key_heap_off()
    }

    fn slot_get(&self, h: u32) -> u32 {
        self.v().get_u32(SLOT_OFFSET + 8 * h as usize)
    }

    fn slot_data_get(&self, h: u32) -> u32 {
        self.v().get_u32(SLOT_OFFSET + 8 * h as usize + 4)
    }

    fn ovl_get(&self, h: u32) -> u32 {
        self.v()
            .get_u32(SLOT_OFFSET + self.nslots as usize * 8 + 4 * h as usize)
    }

    fn slot_put(&self, h: u32, keyoff: u32, data: u32) {
        let view = self.v();
        view.put_u32(SLOT_OFFSET + 8 * h as usize, keyoff);
        view.put_u32(SLOT_OFFSET + 8 * h as usize + 4, data);
    }

    fn ovl_put(&self, h: u32, ovldata: u32) {
        self.v()
            .put_u32(SLOT_OFFSET + self.nslots as usize * 8 + 4 * h as usize, ovldata);
    }

    fn bump_generation(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.v().put_u32(OFFSET_GENERATION, self.generation);
    }

    fn update_usedslots(&self) {
        self.v().put_u32(OFFSET_USEDSLOTS, self.usedslots);
    }

    fn update_dummyslots(&self) {
        self.v().put_u32(OFFSET_DUMMYSLOTS, self.dummyslots);
    }

    fn update_keyend(&self) {
        self.v().put_u32(OFFSET_KEYEND, self.keyend);
    }

    fn update_keyexcess(&self) {
        self.v().put_u32(OFFSET_KEYEXCESS, self.keyexcess);
    }

    /*** Key management ***/

    /// Compare the heap entry at heap offset `off` with `key`.
    fn equal_key(&self, off: u32, key: &[u8]) -> bool {
        let keyl = key.len() as u32;
        if off + keyl + 1 > self.keyend {
            return false;
        }
        let hl = keyl_size(keyl);
        if self.key_size() - (off as usize) < hl + key.len() {
            return false;
        }
        let mut lenbuf = [0u8; 7];
        encode_keyl(&mut lenbuf, keyl);
        let view = self.v();
        let stored = view.bytes(self.key_heap_off() + off as usize, hl + key.len());
        stored[..hl] == lenbuf[..hl] && &stored[hl..] == key
    }

    /// Grow the blob to make room in the key heap. The mapping moves, so
    /// any cached view is stale after this.
    fn add_key_page(&mut self) -> Result<()> {
        let addsize = self.pagesize.max(KEY_CHUNKSIZE);
        let newsize = self.v().len() + addsize;
        self.xdb.borrow_mut().resize_blob(self.xdbid, newsize)?;
        if self.map.view.get().is_none() {
            return Err(crate::error::corrupt("index blob lost its mapping"));
        }
        Ok(())
    }

    /// Append `key` to the heap and return its heap offset.
    fn add_new_key(&mut self, key: &[u8]) -> Result<u32> {
        let keyl = key.len() as u32;
        let hl = keyl_size(keyl);
        while self.key_size() - (self.keyend as usize) < hl + key.len() {
            self.add_key_page()?;
        }
        let mut lenbuf = [0u8; 7];
        encode_keyl(&mut lenbuf, keyl);
        let base = self.key_heap_off() + self.keyend as usize;
        let view = self.v();
        view.write(base, &lenbuf[..hl]);
        view.write(base + hl, key);
        let keyoff = self.keyend;
        self.keyend += (hl + key.len()) as u32;
        self.update_keyend();
        Ok(keyoff)
    }

    /*** Rebuild ***/

    /// Rebuild when hashing, the key heap, or the offset bits run out of
    /// room.
    fn check(&mut self) -> Result<()> {
        if self.usedslots * 2 > self.nslots
            || (self.keyexcess > 4096 && self.keyexcess * 4 > self.keyend)
            || self.keyend >= !self.xmask
        {
            self.rebuild_internal()?;
        }
        Ok(())
    }

    fn rebuild_internal(&mut self) -> Result<()> {
        // count the live slots the hard way instead of trusting usedslots
        let had_old = self.nslots != 0 && self.map.view.get().is_some();
        let mut live = 0u32;
        if had_old {
            for i in 0..self.nslots {
                let x = self.slot_get(i);
                if x != 0 && x != DUMMY {
                    live += 1;
                }
            }
        }
        let mut nslots = live.max(256);
        while nslots & (nslots - 1) != 0 {
            nslots &= nslots - 1;
        }
        nslots *= 4;
        let hmask = nslots - 1;

        // new key space, rounded so the blob ends on a page boundary
        let mut key_size = (self.keyend as usize).max(KEY_CHUNKSIZE);
        let mut file_size = SLOT_OFFSET + nslots as usize * 12 + key_size;
        if file_size & (self.pagesize - 1) != 0 {
            let add = self.pagesize - (file_size & (self.pagesize - 1));
            file_size += add;
            key_size += add;
        }

        // xmask: leave at least 8k headroom for key growth
        let mut xm = 0x0001_0000u32;
        while xm != 0 && (xm as usize) < key_size + 8192 {
            xm <<= 1;
        }
        let xmask = if xm != 0 { !(xm - 1) } else { 0 };

        // build the new table in the rebuild sub-blob
        let newid = self
            .xdb
            .borrow_mut()
            .lookup_blob(self.tag, SUBTAG_REBUILD, true, true)?;
        self.xdb.borrow_mut().resize_blob(newid, file_size)?;
        let newmap = Rc::new(MapCell::default());
        self.xdb.borrow_mut().map_blob(newid, true, newmap.clone())?;
        let newview = newmap.view.get().expect("rebuild blob mapped");

        let new_heap_off = SLOT_OFFSET + nslots as usize * 12;
        let mut new_usedslots = 0u32;
        let mut new_keyend = 1u32;

        // the old window must be re-fetched here: allocating the rebuild
        // blob may have relocated the old blob (and our mapping with it)
        let oldview = if had_old { self.map.view.get() } else { None };
        if let Some(oldv) = oldview {
            let old_heap_off = self.key_heap_off();
            let mut done = vec![0u8; self.nslots as usize / 8 + 1];
            for i in 0..self.nslots {
                let x = self.slot_get(i);
                if x == 0 || x == DUMMY {
                    continue;
                }
                if done[i as usize >> 3] & (1 << (i & 7)) != 0 {
                    continue; // all entries of this key are already over
                }
                let oldkeyoff = x & !self.xmask;
                if oldkeyoff >= self.keyend {
                    continue; // stale offset, drop the entry
                }
                let avail = (self.keyend - oldkeyoff) as usize;
                let hdr = oldv.bytes(old_heap_off + oldkeyoff as usize, avail.min(7));
                let Some((keyl, hl)) = decode_keyl(hdr) else {
                    continue; // stale offset, drop the entry
                };
                if hl + keyl as usize > avail {
                    continue;
                }
                let entry =
                    oldv.bytes(old_heap_off + oldkeyoff as usize, hl + keyl as usize);
                let keyoff = new_keyend;
                newview.write(new_heap_off + keyoff as usize, entry);
                new_keyend += (hl + keyl as usize) as u32;

                // move every entry of this key, probing the old table once
                let key = &entry[hl..];
                let keyh = murmurhash(key);
                let tagged_old = oldkeyoff | (keyh & self.xmask);
                let tagged_new = keyoff | (keyh & xmask);
                let mut h = keyh & self.hmask;
                let mut hh = 7u32;
                loop {
                    let x = self.slot_get(h);
                    if x == 0 {
                        break;
                    }
                    if x == tagged_old {
                        let data = self.slot_data_get(h);
                        let ovldata = if data & 0x8000_0000 != 0 {
                            self.ovl_get(h)
                        } else {
                            0
                        };
                        // find an empty slot in the new table
                        let mut nh = keyh & hmask;
                        let mut nhh = 7u32;
                        while newview.get_u32(SLOT_OFFSET + 8 * nh as usize) != 0 {
                            nh = nh.wrapping_add(nhh) & hmask;
                            nhh += 1;
                        }
                        newview.put_u32(SLOT_OFFSET + 8 * nh as usize, tagged_new);
                        newview.put_u32(SLOT_OFFSET + 8 * nh as usize + 4, data);
                        if ovldata != 0 {
                            newview.put_u32(
                                SLOT_OFFSET + nslots as usize * 8 + 4 * nh as usize,
                                ovldata,
                            );
                        }
                        new_usedslots += 1;
                        done[h as usize >> 3] |= 1 << (h & 7);
                    }
                    h = h.wrapping_add(hh) & self.hmask;
                    hh += 1;
                }
            }
        }

        let new_generation = self.generation.wrapping_add(1);
        newview.put_u32(OFFSET_MAGIC, IDXDB_MAGIC);
        newview.put_u32(OFFSET_VERSION, IDXDB_VERSION);
        newview.put_u32(OFFSET_GENERATION, new_generation);
        newview.put_u32(OFFSET_NSLOTS, nslots);
        newview.put_u32(OFFSET_USEDSLOTS, new_usedslots);
        newview.put_u32(OFFSET_DUMMYSLOTS, 0);
        newview.put_u32(OFFSET_XMASK, xmask);
        newview.put_u32(OFFSET_KEYEND, new_keyend);
        newview.put_u32(OFFSET_KEYEXCESS, 0);
        self.xdb.borrow_mut().unmap_blob(newid)?;

        // drop key space we over-allocated
        let xfile_size = {
            let sz = file_size - key_size + new_keyend as usize + KEY_CHUNKSIZE;
            (sz + self.pagesize - 1) & !(self.pagesize - 1)
        };
        if xfile_size < file_size {
            let _ = self.xdb.borrow_mut().resize_blob(newid, xfile_size);
        }

        // switch over
        self.unmap();
        let newid = self.xdb.borrow_mut().rename_blob(newid, self.tag, SUBTAG)?;
        self.xdbid = newid;
        self.read_header()
    }

    fn init(&mut self) -> Result<()> {
        self.lock(true)?;
        let rc = (|| {
            // somebody else may have been faster
            match self.xdb.borrow_mut().lookup_blob(self.tag, SUBTAG, false, false) {
                Ok(id) => {
                    self.xdbid = id;
                    return Ok(());
                }
                Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
            self.rebuild_internal()
        })();
        let _ = self.unlock(true);
        rc
    }

    /*** Operations ***/

    fn put_internal(&mut self, key: &[u8], pkgidx: u32, datidx: u32) -> Result<()> {
        self.check()?;
        let keyh = murmurhash(key);
        let (data, ovldata) = encode_data(pkgidx, datidx);
        let hmask = self.hmask;
        let xmask = self.xmask;
        let mut keyoff = 0u32;
        let mut freeh: Option<u32> = None;
        let mut h = keyh & hmask;
        let mut hh = 7u32;
        loop {
            let x = self.slot_get(h);
            if x == 0 {
                break; // reached an empty slot
            }
            if x == DUMMY {
                freeh = Some(h); // reusable tombstone
                h = h.wrapping_add(hh) & hmask;
                hh += 1;
                continue;
            }
            if keyoff == 0 {
                if (x ^ keyh) & xmask != 0 || !self.equal_key(x & !xmask, key) {
                    h = h.wrapping_add(hh) & hmask;
                    hh += 1;
                    continue;
                }
                keyoff = x;
            }
            if keyoff == x {
                // key matches, check the data words
                if self.slot_data_get(h) == data
                    && (ovldata == 0 || self.ovl_get(h) == ovldata)
                {
                    return Ok(()); // already present
                }
            }
            h = h.wrapping_add(hh) & hmask;
            hh += 1;
        }
        if keyoff == 0 {
            // first entry for this key
            keyoff = self.add_new_key(key)? | (keyh & xmask);
        }
        let h = match freeh {
            None => {
                self.usedslots += 1;
                self.update_usedslots();
                h
            }
            Some(freeh) => {
                if self.dummyslots > 0 {
                    self.dummyslots -= 1;
                    self.update_dummyslots();
                }
                freeh
            }
        };
        self.slot_put(h, keyoff, data);
        if ovldata != 0 {
            self.ovl_put(h, ovldata);
        }
        self.bump_generation();
        Ok(())
    }

    fn del_internal(&mut self, key: &[u8], pkgidx: u32, datidx: u32) -> Result<()> {
        self.check()?;
        let keyh = murmurhash(key);
        let (data, ovldata) = encode_data(pkgidx, datidx);
        let hmask = self.hmask;
        let xmask = self.xmask;
        let mut keyoff = 0u32;
        let mut otherusers = false;
        let mut h = keyh & hmask;
        let mut hh = 7u32;
        loop {
            let x = self.slot_get(h);
            if x == 0 {
                break;
            }
            if x != DUMMY {
                'slot: {
                    if keyoff == 0 {
                        if (x ^ keyh) & xmask != 0 || !self.equal_key(x & !xmask, key) {
                            break 'slot;
                        }
                        keyoff = x;
                    }
                    if keyoff != x {
                        break 'slot;
                    }
                    // key matches, check the data words
                    if self.slot_data_get(h) != data {
                        otherusers = true;
                        break 'slot;
                    }
                    if ovldata != 0 && self.ovl_get(h) != ovldata {
                        otherusers = true;
                        break 'slot;
                    }
                    // found it; leave a tombstone in the probe chain
                    self.slot_put(h, DUMMY, DUMMY);
                    if ovldata != 0 {
                        self.ovl_put(h, 0);
                    }
                    self.dummyslots += 1;
                    self.update_dummyslots();
                    // keep going: the key may have more entries
                }
            }
            h = h.wrapping_add(hh) & hmask;
            hh += 1;
        }
        if keyoff != 0 && !otherusers {
            // last reference to the key is gone, punch it out of the heap
            let keyl = key.len() as u32;
            let hl = keyl_size(keyl);
            let base = self.key_heap_off() + (keyoff & !xmask) as usize;
            self.v().fill_zero(base, hl + key.len());
            self.keyexcess += (hl + key.len()) as u32;
            self.update_keyexcess();
        }
        if keyoff != 0 {
            self.bump_generation();
        }
        Ok(())
    }

    fn get_internal(&mut self, key: &[u8]) -> Result<Vec<(u32, u32)>> {
        let keyh = murmurhash(key);
        let hmask = self.hmask;
        let xmask = self.xmask;
        let mut keyoff = 0u32;
        let mut hits = Vec::new();
        let mut h = keyh & hmask;
        let mut hh = 7u32;
        loop {
            let x = self.slot_get(h);
            if x == 0 {
                break;
            }
            if x != DUMMY {
                'slot: {
                    if keyoff == 0 {
                        if (x ^ keyh) & xmask != 0 || !self.equal_key(x & !xmask, key) {
                            break 'slot;
                        }
                        keyoff = x;
                    }
                    if keyoff != x {
                        break 'slot;
                    }
                    let data = self.slot_data_get(h);
                    let ovldata = if data & 0x8000_0000 != 0 {
                        self.ovl_get(h)
                    } else {
                        0
                    };
                    hits.push(decode_data(data, ovldata));
                }
            }
            h = h.wrapping_add(hh) & hmask;
            hh += 1;
        }
        if hits.is_empty() {
            Err(Error::NotFound)
        } else {
            Ok(hits)
        }
    }

    fn list_internal(&mut self) -> Result<Vec<Vec<u8>>> {
        let view = self.v();
        let heap = self.key_heap_off();
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let mut off = 1usize;
        let keyend = self.keyend as usize;
        while off < keyend {
            if view.bytes(heap + off, 1)[0] == 0 {
                off += 1; // freed key, zero-filled
                continue;
            }
            let Some((keyl, hl)) = decode_keyl(view.bytes(heap + off, (keyend - off).min(7)))
            else {
                break;
            };
            if off + hl + keyl as usize > keyend {
                break;
            }
            let mut key = vec![0u8; keyl as usize];
            view.read(heap + off + hl, &mut key);
            keys.push(key);
            off += hl + keyl as usize;
        }
        // hash order gives sequential slot access to whoever walks the keys
        keys.sort_by_key(|k| murmurhash(k) & self.hmask);
        Ok(keys)
    }

    /// Record that `pkgidx` carries `key` at tag position `datidx`.
    pub fn put(&mut self, key: &[u8], pkgidx: u32, datidx: u32) -> Result<()> {
        if pkgidx == 0 {
            return Err(Error::InvalidArg("package id must be nonzero"));
        }
        if datidx >= 0x8000_0000 {
            return Err(Error::InvalidArg("tag index does not fit the encoding"));
        }
        self.lock_read_header(true)?;
        let rc = self.put_internal(key, pkgidx, datidx);
        let _ = self.unlock(true);
        rc
    }

    /// Drop the `(key, pkgidx, datidx)` entry. Removing an absent entry
    /// succeeds.
    pub fn del(&mut self, key: &[u8], pkgidx: u32, datidx: u32) -> Result<()> {
        if pkgidx == 0 {
            return Err(Error::InvalidArg("package id must be nonzero"));
        }
        if datidx >= 0x8000_0000 {
            return Err(Error::InvalidArg("tag index does not fit the encoding"));
        }
        self.lock_read_header(true)?;
        let rc = self.del_internal(key, pkgidx, datidx);
        let _ = self.unlock(true);
        rc
    }

    /// The posting list for `key`, or [`Error::NotFound`].
    pub fn get(&mut self, key: &[u8]) -> Result<Vec<(u32, u32)>> {
        self.lock_read_header(false)?;
        let rc = self.get_internal(key);
        let _ = self.unlock(false);
        rc
    }

    /// All keys, in hash order.
    pub fn list(&mut self) -> Result<Vec<Vec<u8>>> {
        self.lock_read_header(false)?;
        let rc = self.list_internal();
        let _ = self.unlock(false);
        rc
    }

    pub fn stats(&mut self) -> Result<IdxDbStats> {
        self.lock_read_header(false)?;
        let stats = IdxDbStats {
            tag: self.tag,
            blob_id: self.xdbid,
            generation: self.generation,
            nslots: self.nslots,
            usedslots: self.usedslots,
            dummyslots: self.dummyslots,
            keyend: self.keyend,
            keyexcess: self.keyexcess,
            xmask: self.xmask,
        };
        let _ = self.unlock(false);
        Ok(stats)
    }
}

impl Drop for IdxDb {
    fn drop(&mut self) {
        self.unmap();
        debug!("closed index for tag {}", self.tag);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkgdb::PkgDb;

    use camino_tempfile::Utf8TempDir;

    fn open_idx(dir: &Utf8TempDir, tag: u32) -> (Rc<RefCell<PkgDb>>, Rc<RefCell<Xdb>>, IdxDb) {
        let pkgdb = Rc::new(RefCell::new(
            PkgDb::open(&dir.path().join("Packages.db"), true, false).unwrap(),
        ));
        let xdb = Rc::new(RefCell::new(
            Xdb::open(pkgdb.clone(), &dir.path().join("Index.db"), true, false).unwrap(),
        ));
        let idx = IdxDb::open(xdb.clone(), tag).unwrap();
        (pkgdb, xdb, idx)
    }

    #[test]
    fn put_get_del_round_trip() {
        let dir = Utf8TempDir::new().unwrap();
        let (_p, _x, mut idx) = open_idx(&dir, 1000);
        assert!(matches!(idx.get(b"name"), Err(Error::NotFound)));
        idx.put(b"name", 5, 2).unwrap();
        assert_eq!(idx.get(b"name").unwrap(), vec![(5, 2)]);
        idx.del(b"name", 5, 2).unwrap();
        assert!(matches!(idx.get(b"name"), Err(Error::NotFound)));
        // deleting again is fine
        idx.del(b"name", 5, 2).unwrap();
    }

    #[test]
    fn multiple_entries_per_key() {
        let dir = Utf8TempDir::new().unwrap();
        let (_p, _x, mut idx) = open_idx(&dir, 1000);
        idx.put(b"libfoo", 1, 0).unwrap();
        idx.put(b"libfoo", 2, 0).unwrap();
        idx.put(b"libfoo", 3, 4).unwrap();
        // duplicate insert is a no-op
        idx.put(b"libfoo", 2, 0).unwrap();
        let mut hits = idx.get(b"libfoo").unwrap();
        hits.sort_unstable();
        assert_eq!(hits, vec![(1, 0), (2, 0), (3, 4)]);
        idx.del(b"libfoo", 2, 0).unwrap();
        let mut hits = idx.get(b"libfoo").unwrap();
        hits.sort_unstable();
        assert_eq!(hits, vec![(1, 0), (3, 4)]);
    }

    #[test]
    fn colliding_keys_stay_separate() {
        let dir = Utf8TempDir::new().unwrap();
        let (_p, _x, mut idx) = open_idx(&dir, 1000);
        let hmask = idx.stats().unwrap().nslots - 1;
        // find two distinct keys that start their probe chain on the same
        // slot
        let a = b"collide-0".to_vec();
        let target = murmurhash(&a) & hmask;
        let mut b = None;
        for i in 1..100000 {
            let cand = format!("collide-{i}").into_bytes();
            if murmurhash(&cand) & hmask == target {
                b = Some(cand);
                break;
            }
        }
        let b = b.expect("no colliding key found");
        idx.put(&a, 1, 0).unwrap();
        idx.put(&b, 2, 0).unwrap();
        assert_eq!(idx.get(&a).unwrap(), vec![(1, 0)]);
        assert_eq!(idx.get(&b).unwrap(), vec![(2, 0)]);
        // removing one key leaves a tombstone the other's chain crosses
        idx.del(&a, 1, 0).unwrap();
        assert!(matches!(idx.get(&a), Err(Error::NotFound)));
        assert_eq!(idx.get(&b).unwrap(), vec![(2, 0)]);
    }

    #[test]
    fn data_encoding_edges() {
        let dir = Utf8TempDir::new().unwrap();
        let (_p, _x, mut idx) = open_idx(&dir, 1000);
        let pairs = [
            (1, 0),
            (0xf_ffff, 0x3ff),          // compact limit
            (0x10_0000, 0x3f),          // mid encoding
            (0xff_ffff, 0x3f),          // mid limit
            (0x100_0000, 0),            // overflow encoding
            (0xffff_ffff, 0x7fff_ffff), // everything maxed
        ];
        for (i, &(pkgidx, datidx)) in pairs.iter().enumerate() {
            let key = format!("edge-{i}").into_bytes();
            idx.put(&key, pkgidx, datidx).unwrap();
            assert_eq!(idx.get(&key).unwrap(), vec![(pkgidx, datidx)], "pair {i}");
        }
        assert!(idx.put(b"bad", 1, 0x8000_0000).is_err());
        assert!(idx.put(b"bad", 0, 1).is_err());
    }

    #[test]
    fn key_length_encodings() {
        let dir = Utf8TempDir::new().unwrap();
        let (_p, _x, mut idx) = open_idx(&dir, 1000);
        for len in [0usize, 1, 254, 255, 300, 65535] {
            let key = vec![b'k'; len];
            idx.put(&key, len as u32 + 1, 0).unwrap();
            assert_eq!(idx.get(&key).unwrap(), vec![(len as u32 + 1, 0)], "len {len}");
        }
        let keys = idx.list().unwrap();
        assert_eq!(keys.len(), 6);
    }

    #[test]
    fn rebuild_keeps_everything() {
        let dir = Utf8TempDir::new().unwrap();
        let (_p, xdb, mut idx) = open_idx(&dir, 1000);
        xdb.borrow_mut().set_user_generation(42).unwrap();
        let nslots0 = idx.stats().unwrap().nslots;
        let n = nslots0 / 2 + 50; // enough to trip the rebuild threshold
        for i in 0..n {
            idx.put(format!("pkg-{i}").as_bytes(), i + 1, 0).unwrap();
        }
        let stats = idx.stats().unwrap();
        assert!(stats.nslots > nslots0, "table should have grown");
        for i in 0..n {
            assert_eq!(
                idx.get(format!("pkg-{i}").as_bytes()).unwrap(),
                vec![(i + 1, 0)],
                "key {i}"
            );
        }
        // the rebuild swapped blobs without touching the user generation
        assert_eq!(xdb.borrow_mut().get_user_generation().unwrap(), 42);
    }

    #[test]
    fn list_returns_live_keys() {
        let dir = Utf8TempDir::new().unwrap();
        let (_p, _x, mut idx) = open_idx(&dir, 1000);
        for i in 0..10 {
            idx.put(format!("file-{i}").as_bytes(), i + 1, 0).unwrap();
        }
        idx.del(b"file-3", 4, 0).unwrap();
        let keys = idx.list().unwrap();
        assert_eq!(keys.len(), 9);
        assert!(!keys.contains(&b"file-3".to_vec()));
        assert!(keys.contains(&b"file-7".to_vec()));
    }

    #[test]
    fn reopen_finds_existing_index() {
        let dir = Utf8TempDir::new().unwrap();
        let (_p, xdb, mut idx) = open_idx(&dir, 1000);
        idx.put(b"persist", 9, 1).unwrap();
        drop(idx);
        let mut idx = IdxDb::open(xdb, 1000).unwrap();
        assert_eq!(idx.get(b"persist").unwrap(), vec![(9, 1)]);
    }

    #[test]
    fn independent_tags_do_not_mix() {
        let dir = Utf8TempDir::new().unwrap();
        let (_p, xdb, mut idx_a) = open_idx(&dir, 1000);
        let mut idx_b = IdxDb::open(xdb, 1001).unwrap();
        idx_a.put(b"shared", 1, 0).unwrap();
        idx_b.put(b"shared", 2, 0).unwrap();
        assert_eq!(idx_a.get(b"shared").unwrap(), vec![(1, 0)]);
        assert_eq!(idx_b.get(b"shared").unwrap(), vec![(2, 0)]);
        idx_a.del(b"shared", 1, 0).unwrap();
        assert!(matches!(idx_a.get(b"shared"), Err(Error::NotFound)));
        assert_eq!(idx_b.get(b"shared").unwrap(), vec![(2, 0)]);
    }
}
