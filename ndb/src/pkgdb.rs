//!
//! Package blob store.
//!
//! One file (`Packages.db`) holds all package header blobs. The file starts
//! with one or more slot pages; everything after them is the blob area,
//! allocated in 16-byte blocks:
//!
//! ```text
//! offset 0                 header: magic 'RpmP', version, generation,
//!                          slotnpages, nextpkgidx, 12 reserved bytes
//! offset 32                slot entries, 16 bytes each
//! offset 4096 * slotnpages blob area, BLK-aligned
//! ```
//!
//! A slot is `(magic 'Slot', pkgidx, blkoff, blkcnt)`; `blkoff == 0` marks a
//! free slot. Each blob is framed with a head `(magic 'BlbS', pkgidx,
//! timestamp, bloblen)` and a tail `(adler32, bloblen, magic 'BlbE')`, the
//! payload padded up to a block boundary. The Adler-32 covers head, payload
//! and padding, so an interrupted write is always detectable.
//!
//! Placement is best-fit over the free gaps between live extents; freed
//! extents are zeroed so that the write path can validate its target range
//! and recover space lost to an interrupted transaction. Deleting a blob in
//! the first half of the data area triggers opportunistic compaction and,
//! when enough of the tail becomes free, file truncation.
//!
//! The whole file is protected by a counting advisory `flock`; the header
//! is re-read whenever the lock is re-acquired so that other processes'
//! mutations (tracked by the generation counter) are picked up.
//!

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::time::SystemTime;

use adler32::RollingAdler32;
use byteorder::{ByteOrder, LittleEndian};
use camino::{Utf8Path, Utf8PathBuf};
use nix::fcntl::{flock, FlockArg};
use tracing::{debug, error, warn};

use crate::error::{corrupt, Error, Result};

pub(crate) const BLK_SIZE: u32 = 16;
pub(crate) const PAGE_SIZE: u32 = 4096;

const SLOT_SIZE: u32 = 16;
const SLOTS_PER_PAGE: u32 = PAGE_SIZE / SLOT_SIZE;
const BLKS_PER_PAGE: u32 = PAGE_SIZE / BLK_SIZE;

const PKGDB_MAGIC: u32 = u32::from_le_bytes(*b"RpmP");
const PKGDB_VERSION: u32 = 0;

// must be a multiple of SLOT_SIZE
const HEADER_SIZE: u32 = 32;

const OFFSET_MAGIC: usize = 0;
const OFFSET_VERSION: usize = 4;
const OFFSET_GENERATION: usize = 8;
const OFFSET_SLOTNPAGES: usize = 12;
const OFFSET_NEXTPKGIDX: usize = 16;

const SLOT_MAGIC: u32 = u32::from_le_bytes(*b"Slot");
// the first two slots of page 0 are occupied by the header
const SLOT_START: u32 = HEADER_SIZE / SLOT_SIZE;

const BLOBHEAD_MAGIC: u32 = u32::from_le_bytes(*b"BlbS");
const BLOBTAIL_MAGIC: u32 = u32::from_le_bytes(*b"BlbE");
const BLOBHEAD_SIZE: u32 = 16;
const BLOBTAIL_SIZE: u32 = 12;

#[cfg(feature = "blob-compress")]
const BLOBZ_MAGIC: u32 = u32::from_le_bytes(*b"BlbZ");

/// In-memory copy of one used slot entry.
#[derive(Debug, Clone, Copy)]
struct PkgSlot {
    pkgidx: u32,
    blkoff: u32,
    blkcnt: u32,
    slotno: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotOrder {
    Unordered,
    ByBlkoff,
}

/// Summary counters for inspection tools.
#[derive(Debug, Clone)]
pub struct PkgDbStats {
    pub path: Utf8PathBuf,
    pub generation: u32,
    pub slot_pages: u32,
    pub used_slots: u32,
    pub free_slots: u32,
    pub blob_area_bytes: u64,
    pub blob_used_bytes: u64,
}

pub struct PkgDb {
    file: File,
    path: Utf8PathBuf,
    rdonly: bool,

    locked_shared: u32,
    locked_excl: u32,

    /// header fields are valid for the current lock scope
    header_ok: bool,
    generation: u32,
    slotnpages: u32,
    nextpkgidx: u32,

    /// used slots, lazily read; `None` after a structural failure
    slots: Option<Vec<PkgSlot>>,
    /// open-addressing index over `slots`, values are slot index + 1
    slothash: Vec<u32>,
    slotorder: SlotOrder,
    /// one known-free slot number, opportunistic
    freeslot: u32,

    /// current file size in blocks
    fileblks: u32,
    dofsync: bool,
}

/// Multiplicative hash for package ids, also used as the murmur constant by
/// the index engine.
pub(crate) const HASH_CONST: u32 = 0x5bd1e995;

#[inline]
fn hash_pkgidx(pkgidx: u32) -> u32 {
    let h = pkgidx.wrapping_mul(HASH_CONST);
    h ^ (h >> 16)
}

fn blob_blkcnt(blobl: usize) -> u32 {
    ((BLOBHEAD_SIZE as usize + blobl + BLOBTAIL_SIZE as usize + BLK_SIZE as usize - 1)
        / BLK_SIZE as usize) as u32
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

impl PkgDb {
    /// Open the package database at `path`, creating and initializing the
    /// file when `create` is set and it does not exist yet.
    pub fn open(path: &Utf8Path, create: bool, rdonly: bool) -> Result<PkgDb> {
        let file = OpenOptions::new()
            .read(true)
            .write(!rdonly)
            .create(create && !rdonly)
            .open(path)?;
        let mut pkgdb = PkgDb {
            file,
            path: path.to_owned(),
            rdonly,
            locked_shared: 0,
            locked_excl: 0,
            header_ok: false,
            generation: 0,
            slotnpages: 0,
            nextpkgidx: 0,
            slots: None,
            slothash: Vec::new(),
            slotorder: SlotOrder::Unordered,
            freeslot: 0,
            fileblks: 0,
            dofsync: true,
        };
        if pkgdb.file.metadata()?.len() == 0 {
            // created a new database file; make the directory entry durable
            // before anything refers to it
            fsync_dir(path)?;
            pkgdb.init()?;
        }
        debug!("opened package db {}", path);
        Ok(pkgdb)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn is_rdonly(&self) -> bool {
        self.rdonly
    }

    /// Disabling fsync trades durability for throughput; an interrupted
    /// transaction can then lose committed writes, but never corrupts the
    /// slot structure.
    pub fn set_fsync(&mut self, dofsync: bool) {
        self.dofsync = dofsync;
    }

    /*** Locking ***/

    fn get_lock(&self, arg: FlockArg) -> Result<()> {
        flock(self.file.as_raw_fd(), arg)
            .map_err(|e| Error::Io(std::io::Error::from_raw_os_error(e as i32)))
    }

    /// Acquire the advisory file lock. Lock counts nest per handle: a shared
    /// acquire while the exclusive lock is held is a no-op bump.
    pub fn lock(&mut self, excl: bool) -> Result<()> {
        if excl && self.rdonly {
            return Err(Error::ReadOnly);
        }
        let held = if excl {
            self.locked_excl
        } else {
            self.locked_shared
        };
        if held > 0 || (!excl && self.locked_excl > 0) {
            if excl {
                self.locked_excl += 1;
            } else {
                self.locked_shared += 1;
            }
            return Ok(());
        }
        // actually changing the lock state: our cached header is no longer
        // authoritative
        self.header_ok = false;
        self.get_lock(if excl {
            FlockArg::LockExclusive
        } else {
            FlockArg::LockShared
        })?;
        if excl {
            self.locked_excl += 1;
        } else {
            self.locked_shared += 1;
        }
        Ok(())
    }

    pub fn unlock(&mut self, excl: bool) -> Result<()> {
        let held = if excl {
            self.locked_excl
        } else {
            self.locked_shared
        };
        if held == 0 {
            return Err(corrupt("unbalanced unlock"));
        }
        if held > 1 || (!excl && self.locked_excl > 0) {
            if excl {
                self.locked_excl -= 1;
            } else {
                self.locked_shared -= 1;
            }
            return Ok(());
        }
        if excl && self.locked_shared > 0 {
            // downgrade: re-take shared before the exclusive count drops
            self.get_lock(FlockArg::LockShared)?;
            self.locked_excl -= 1;
            return Ok(());
        }
        let _ = self.get_lock(FlockArg::Unlock);
        if excl {
            self.locked_excl -= 1;
        } else {
            self.locked_shared -= 1;
        }
        self.header_ok = false;
        Ok(())
    }

    fn lock_read_header(&mut self, excl: bool) -> Result<()> {
        self.lock(excl)?;
        if let Err(e) = self.read_header() {
            let _ = self.unlock(excl);
            return Err(e);
        }
        Ok(())
    }

    /*** Header management ***/

    fn read_header(&mut self) -> Result<()> {
        // while we hold the lock our data stays authoritative
        if self.header_ok {
            return Ok(());
        }
        let mut header = [0u8; HEADER_SIZE as usize];
        self.file.read_exact_at(&mut header, 0)?;
        if LittleEndian::read_u32(&header[OFFSET_MAGIC..]) != PKGDB_MAGIC {
            return Err(corrupt(format!("{}: bad magic", self.path)));
        }
        let version = LittleEndian::read_u32(&header[OFFSET_VERSION..]);
        if version != PKGDB_VERSION {
            error!(
                "{}: version mismatch, expected {}, found {}",
                self.path, PKGDB_VERSION, version
            );
            return Err(corrupt(format!("{}: version {}", self.path, version)));
        }
        let generation = LittleEndian::read_u32(&header[OFFSET_GENERATION..]);
        let slotnpages = LittleEndian::read_u32(&header[OFFSET_SLOTNPAGES..]);
        let nextpkgidx = LittleEndian::read_u32(&header[OFFSET_NEXTPKGIDX..]);
        // drop the slot cache if it no longer matches the file
        if self.slots.is_some()
            && (self.generation != generation || self.slotnpages != slotnpages)
        {
            self.slots = None;
            self.slothash.clear();
        }
        self.generation = generation;
        self.slotnpages = slotnpages;
        self.nextpkgidx = nextpkgidx;
        self.header_ok = true;
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE as usize];
        LittleEndian::write_u32(&mut header[OFFSET_MAGIC..], PKGDB_MAGIC);
        LittleEndian::write_u32(&mut header[OFFSET_VERSION..], PKGDB_VERSION);
        LittleEndian::write_u32(&mut header[OFFSET_GENERATION..], self.generation);
        LittleEndian::write_u32(&mut header[OFFSET_SLOTNPAGES..], self.slotnpages);
        LittleEndian::write_u32(&mut header[OFFSET_NEXTPKGIDX..], self.nextpkgidx);
        self.file.write_all_at(&header, 0)?;
        if self.dofsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /*** Slot management ***/

    fn hash_slots(&mut self) {
        let slots = self.slots.as_ref().expect("slot table not read");
        let nslots = slots.len() as u32;
        // size: four times the next power of two below the slot count
        let mut num = 1u32;
        while num * 2 <= nslots {
            num *= 2;
        }
        num *= 4;
        let hmask = num - 1;
        let mut hash = vec![0u32; num as usize];
        for (i, slot) in slots.iter().enumerate() {
            let mut h = hash_pkgidx(slot.pkgidx) & hmask;
            let mut hh = 7u32;
            while hash[h as usize] != 0 {
                h = h.wrapping_add(hh) & hmask;
                hh += 1;
            }
            hash[h as usize] = i as u32 + 1;
        }
        self.slothash = hash;
    }

    /// Read and verify all slot pages, rebuilding the in-memory slot table.
    fn read_slots(&mut self) -> Result<()> {
        self.slots = None;
        self.slothash.clear();
        self.freeslot = 0;

        let filelen = self.file.metadata()?.len();
        if filelen % BLK_SIZE as u64 != 0 {
            return Err(corrupt(format!(
                "{}: file size {} not a multiple of the block size",
                self.path, filelen
            )));
        }
        let fileblks = (filelen / BLK_SIZE as u64) as u32;
        let minblkoff = self.slotnpages * BLKS_PER_PAGE;

        let mut slots = Vec::new();
        let mut pagebuf = [0u8; PAGE_SIZE as usize];
        let mut slotno = SLOT_START;
        let mut freeslot = 0;
        for page in 0..self.slotnpages {
            self.file
                .read_exact_at(&mut pagebuf, page as u64 * PAGE_SIZE as u64)?;
            let mut o = if page == 0 {
                (SLOT_START * SLOT_SIZE) as usize
            } else {
                0
            };
            while o < PAGE_SIZE as usize {
                let pp = &pagebuf[o..o + SLOT_SIZE as usize];
                if LittleEndian::read_u32(pp) != SLOT_MAGIC {
                    return Err(corrupt(format!("{}: bad slot magic", self.path)));
                }
                let blkoff = LittleEndian::read_u32(&pp[8..]);
                if blkoff == 0 {
                    if freeslot == 0 {
                        freeslot = slotno;
                    }
                    o += SLOT_SIZE as usize;
                    slotno += 1;
                    continue;
                }
                let pkgidx = LittleEndian::read_u32(&pp[4..]);
                let blkcnt = LittleEndian::read_u32(&pp[12..]);
                if blkoff + blkcnt > fileblks {
                    return Err(corrupt(format!("{}: truncated blob area", self.path)));
                }
                if pkgidx == 0 || blkcnt == 0 || blkoff < minblkoff {
                    return Err(corrupt(format!("{}: bad slot entry", self.path)));
                }
                slots.push(PkgSlot {
                    pkgidx,
                    blkoff,
                    blkcnt,
                    slotno,
                });
                o += SLOT_SIZE as usize;
                slotno += 1;
            }
        }
        self.slots = Some(slots);
        self.slotorder = SlotOrder::Unordered;
        self.fileblks = fileblks;
        self.freeslot = freeslot;
        self.hash_slots();
        Ok(())
    }

    fn order_slots(&mut self, order: SlotOrder) {
        if self.slotorder == order {
            return;
        }
        if order == SlotOrder::ByBlkoff {
            if let Some(slots) = self.slots.as_mut() {
                slots.sort_by_key(|s| s.blkoff);
            }
        }
        self.slotorder = order;
        self.hash_slots();
    }

    fn find_slot(&self, pkgidx: u32) -> Option<usize> {
        let slots = self.slots.as_ref()?;
        let hmask = self.slothash.len() as u32 - 1;
        let mut h = hash_pkgidx(pkgidx) & hmask;
        let mut hh = 7u32;
        loop {
            let i = self.slothash[h as usize];
            if i == 0 {
                return None;
            }
            if slots[i as usize - 1].pkgidx == pkgidx {
                return Some(i as usize - 1);
            }
            h = h.wrapping_add(hh) & hmask;
            hh += 1;
        }
    }

    /// Best-fit search over the gaps between live extents. Returns the chosen
    /// block offset and the index of the slot already holding `pkgidx`, if
    /// any. With `dontprepend` the area below the first blob is not
    /// considered (used while freeing up the next slot page).
    fn find_empty_offset(
        &mut self,
        pkgidx: u32,
        blkcnt: u32,
        dontprepend: bool,
    ) -> Result<(u32, Option<usize>)> {
        self.order_slots(SlotOrder::ByBlkoff);
        let slots = self.slots.as_ref().expect("slot table not read");
        let mut lastblkend = self.slotnpages * BLKS_PER_PAGE;
        if dontprepend && !slots.is_empty() {
            lastblkend = slots[0].blkoff;
        }
        let mut oldslot = None;
        let mut bestblkoff = 0u32;
        let mut bestfreecnt = 0u32;
        for (i, slot) in slots.iter().enumerate() {
            if slot.blkoff == 0 {
                // parked free entry left behind by a delete
                continue;
            }
            if slot.blkoff < lastblkend {
                return Err(corrupt(format!("{}: overlapping slots", self.path)));
            }
            if slot.pkgidx == pkgidx {
                if oldslot.is_some() {
                    return Err(corrupt(format!(
                        "{}: duplicate slots for package {}",
                        self.path, pkgidx
                    )));
                }
                oldslot = Some(i);
            }
            let freecnt = slot.blkoff - lastblkend;
            if freecnt >= blkcnt && (bestblkoff == 0 || bestfreecnt > freecnt) {
                bestblkoff = lastblkend;
                bestfreecnt = freecnt;
            }
            lastblkend = slot.blkoff + slot.blkcnt;
        }
        if bestblkoff == 0 {
            bestblkoff = lastblkend; // append to end
        }
        Ok((bestblkoff, oldslot))
    }

    /// Check that `[blkoff, blkoff + blkcnt)` is an unused gap bounded by
    /// intact blobs, and return the gap length up to the right neighbor.
    fn neighbour_check(&mut self, blkoff: u32, blkcnt: u32) -> Result<u32> {
        self.order_slots(SlotOrder::ByBlkoff);
        let slots = self.slots.as_ref().expect("slot table not read");
        let mut lastblkend = self.slotnpages * BLKS_PER_PAGE;
        if blkoff < lastblkend {
            return Err(corrupt(format!("{}: target below blob area", self.path)));
        }
        let mut left: Option<PkgSlot> = None;
        let mut right: Option<PkgSlot> = None;
        for slot in slots.iter() {
            if slot.blkoff < lastblkend {
                return Err(corrupt(format!("{}: overlapping slots", self.path)));
            }
            if slot.blkoff < blkoff {
                left = Some(*slot);
            }
            if right.is_none() && slot.blkoff >= blkoff {
                right = Some(*slot);
            }
            lastblkend = slot.blkoff + slot.blkcnt;
        }
        match left {
            Some(l) if l.blkoff + l.blkcnt != blkoff => {
                return Err(corrupt(format!("{}: stale area has no left bound", self.path)))
            }
            None if blkoff != self.slotnpages * BLKS_PER_PAGE => {
                return Err(corrupt(format!("{}: stale area has no left bound", self.path)))
            }
            _ => {}
        }
        if let Some(r) = right {
            if r.blkoff < blkoff + blkcnt {
                return Err(corrupt(format!("{}: stale area overlaps a blob", self.path)));
            }
        }
        if let Some(l) = left {
            self.read_blob(l.pkgidx, l.blkoff, l.blkcnt)?;
        }
        if let Some(r) = right {
            self.read_blob(r.pkgidx, r.blkoff, r.blkcnt)?;
        }
        Ok(match right {
            Some(r) => r.blkoff - blkoff,
            None => blkcnt,
        })
    }

    fn write_slot(&mut self, slotno: u32, pkgidx: u32, blkoff: u32, blkcnt: u32) -> Result<()> {
        if slotno < SLOT_START {
            return Err(corrupt(format!("{}: slot number underflow", self.path)));
        }
        if blkoff != 0 && slotno == self.freeslot {
            self.freeslot = 0;
        }
        let mut buf = [0u8; SLOT_SIZE as usize];
        LittleEndian::write_u32(&mut buf[0..], SLOT_MAGIC);
        LittleEndian::write_u32(&mut buf[4..], pkgidx);
        LittleEndian::write_u32(&mut buf[8..], blkoff);
        LittleEndian::write_u32(&mut buf[12..], blkcnt);
        self.file
            .write_all_at(&buf, slotno as u64 * SLOT_SIZE as u64)?;
        self.generation = self.generation.wrapping_add(1);
        self.write_header()
    }

    fn write_empty_slotpage(&mut self, pageno: u32) -> Result<()> {
        let mut page = [0u8; PAGE_SIZE as usize];
        for i in 0..SLOTS_PER_PAGE {
            LittleEndian::write_u32(&mut page[(i * SLOT_SIZE) as usize..], SLOT_MAGIC);
        }
        let off = if pageno == 0 {
            (SLOT_START * SLOT_SIZE) as usize
        } else {
            0
        };
        self.file.write_all_at(
            &page[off..],
            pageno as u64 * PAGE_SIZE as u64 + off as u64,
        )?;
        if self.dofsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /*** Block primitives ***/

    fn zero_blks(&mut self, blkoff: u32, blkcnt: u32) -> Result<()> {
        let buf = [0u8; 65536];
        let mut fileoff = blkoff as u64 * BLK_SIZE as u64;
        let mut towrite = blkcnt as u64 * BLK_SIZE as u64;
        while towrite > 0 {
            let chunk = towrite.min(buf.len() as u64) as usize;
            self.file.write_all_at(&buf[..chunk], fileoff)?;
            fileoff += chunk as u64;
            towrite -= chunk as u64;
        }
        if blkoff + blkcnt > self.fileblks {
            self.fileblks = blkoff + blkcnt;
        }
        Ok(())
    }

    fn validate_zero_check(&self, blkoff: u32, blkcnt: u32) -> Result<()> {
        if blkoff > self.fileblks {
            return Err(corrupt(format!("{}: check beyond end of file", self.path)));
        }
        let mut fileoff = blkoff as u64 * BLK_SIZE as u64;
        let infile = if blkoff + blkcnt > self.fileblks {
            self.fileblks - blkoff
        } else {
            blkcnt
        };
        let mut tocheck = infile as u64 * BLK_SIZE as u64;
        let mut buf = [0u8; 65536];
        while tocheck > 0 {
            let chunk = tocheck.min(buf.len() as u64) as usize;
            self.file.read_exact_at(&mut buf[..chunk], fileoff)?;
            if buf[..chunk].iter().any(|&b| b != 0) {
                return Err(corrupt(format!("{}: target area not empty", self.path)));
            }
            fileoff += chunk as u64;
            tocheck -= chunk as u64;
        }
        Ok(())
    }

    /// Make sure the target area holds no data before it is written to. A
    /// non-zero area bounded by intact neighbor blobs is the leftover of an
    /// interrupted transaction and gets zeroed; anything else fails.
    fn validate_zero(&mut self, blkoff: u32, blkcnt: u32) -> Result<()> {
        if self.validate_zero_check(blkoff, blkcnt).is_ok() {
            return Ok(());
        }
        warn!("{}: detected non-zero blob area, trying auto repair", self.path);
        let newblkcnt = self.neighbour_check(blkoff, blkcnt)?;
        self.zero_blks(blkoff, newblkcnt)
    }

    /*** Blob primitives ***/

    /// Read the blob at `[blkoff, blkoff + blkcnt)`, verifying the framing
    /// and checksum. Returns the payload and the stored timestamp.
    fn read_blob(&self, pkgidx: u32, blkoff: u32, blkcnt: u32) -> Result<(Vec<u8>, u32)> {
        if blkcnt < blob_blkcnt(0) {
            return Err(corrupt(format!("{}: blob extent too small", self.path)));
        }
        let fileoff = blkoff as u64 * BLK_SIZE as u64;
        let mut buf = vec![0u8; blkcnt as usize * BLK_SIZE as usize];
        self.file.read_exact_at(&mut buf, fileoff)?;
        if LittleEndian::read_u32(&buf[0..]) != BLOBHEAD_MAGIC {
            return Err(corrupt(format!("{}: bad blob head magic", self.path)));
        }
        if LittleEndian::read_u32(&buf[4..]) != pkgidx {
            return Err(corrupt(format!(
                "{}: blob belongs to package {}, expected {}",
                self.path,
                LittleEndian::read_u32(&buf[4..]),
                pkgidx
            )));
        }
        let tstamp = LittleEndian::read_u32(&buf[8..]);
        let bloblen = LittleEndian::read_u32(&buf[12..]);
        if blkcnt != blob_blkcnt(bloblen as usize) {
            return Err(corrupt(format!("{}: blob length mismatch", self.path)));
        }
        let tailoff = buf.len() - BLOBTAIL_SIZE as usize;
        let mut adler = RollingAdler32::new();
        adler.update_buffer(&buf[..tailoff]);
        if LittleEndian::read_u32(&buf[tailoff..]) != adler.hash() {
            return Err(corrupt(format!("{}: blob checksum mismatch", self.path)));
        }
        if LittleEndian::read_u32(&buf[tailoff + 4..]) != bloblen {
            return Err(corrupt(format!("{}: blob tail length mismatch", self.path)));
        }
        if LittleEndian::read_u32(&buf[tailoff + 8..]) != BLOBTAIL_MAGIC {
            return Err(corrupt(format!("{}: bad blob tail magic", self.path)));
        }
        buf.drain(..BLOBHEAD_SIZE as usize);
        buf.truncate(bloblen as usize);
        Ok((buf, tstamp))
    }

    fn verify_blob(&self, pkgidx: u32, blkoff: u32, blkcnt: u32) -> Result<()> {
        self.read_blob(pkgidx, blkoff, blkcnt).map(|_| ())
    }

    fn write_blob(
        &mut self,
        pkgidx: u32,
        blkoff: u32,
        blkcnt: u32,
        blob: &[u8],
        tstamp: u32,
    ) -> Result<()> {
        if blkcnt != blob_blkcnt(blob.len()) {
            return Err(corrupt(format!("{}: blob block count mismatch", self.path)));
        }
        let mut buf = vec![0u8; blkcnt as usize * BLK_SIZE as usize];
        LittleEndian::write_u32(&mut buf[0..], BLOBHEAD_MAGIC);
        LittleEndian::write_u32(&mut buf[4..], pkgidx);
        LittleEndian::write_u32(&mut buf[8..], tstamp);
        LittleEndian::write_u32(&mut buf[12..], blob.len() as u32);
        buf[BLOBHEAD_SIZE as usize..BLOBHEAD_SIZE as usize + blob.len()].copy_from_slice(blob);
        let tailoff = buf.len() - BLOBTAIL_SIZE as usize;
        let mut adler = RollingAdler32::new();
        adler.update_buffer(&buf[..tailoff]);
        LittleEndian::write_u32(&mut buf[tailoff..], adler.hash());
        LittleEndian::write_u32(&mut buf[tailoff + 4..], blob.len() as u32);
        LittleEndian::write_u32(&mut buf[tailoff + 8..], BLOBTAIL_MAGIC);
        self.file
            .write_all_at(&buf, blkoff as u64 * BLK_SIZE as u64)?;
        if blkoff + blkcnt > self.fileblks {
            self.fileblks = blkoff + blkcnt;
        }
        if self.dofsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn del_blob(&mut self, pkgidx: u32, blkoff: u32, blkcnt: u32) -> Result<()> {
        self.verify_blob(pkgidx, blkoff, blkcnt)?;
        self.zero_blks(blkoff, blkcnt)?;
        if self.dofsync {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Rewrite the blob of `slots[idx]` at `newblkoff` and free the old
    /// extent. The stored timestamp travels with the blob.
    fn move_blob(&mut self, idx: usize, newblkoff: u32) -> Result<()> {
        let slot = self.slots.as_ref().expect("slot table not read")[idx];
        let (blob, tstamp) = self.read_blob(slot.pkgidx, slot.blkoff, slot.blkcnt)?;
        self.write_blob(slot.pkgidx, newblkoff, slot.blkcnt, &blob, tstamp)?;
        self.write_slot(slot.slotno, slot.pkgidx, newblkoff, slot.blkcnt)?;
        self.del_blob(slot.pkgidx, slot.blkoff, slot.blkcnt)?;
        self.slots.as_mut().expect("slot table not read")[idx].blkoff = newblkoff;
        self.slotorder = SlotOrder::Unordered;
        Ok(())
    }

    /// Extend the slot area by one page, relocating any blobs that sit in
    /// the way first.
    fn add_slot_page(&mut self) -> Result<()> {
        self.order_slots(SlotOrder::ByBlkoff);
        let cutoff = (self.slotnpages + 1) * BLKS_PER_PAGE;

        // move every blob that lives below the cutoff out of the way
        loop {
            let first = match self.slots.as_ref().expect("slot table not read").first() {
                Some(s) if s.blkoff < cutoff => *s,
                _ => break,
            };
            let (newblkoff, oldslot) =
                self.find_empty_offset(first.pkgidx, first.blkcnt, true)?;
            if oldslot != Some(0) {
                return Err(corrupt(format!("{}: slot table inconsistent", self.path)));
            }
            self.move_blob(0, newblkoff)?;
            self.order_slots(SlotOrder::ByBlkoff);
        }

        self.validate_zero(self.slotnpages * BLKS_PER_PAGE, BLKS_PER_PAGE)?;
        self.write_empty_slotpage(self.slotnpages)?;

        self.freeslot = self.slotnpages * SLOTS_PER_PAGE;
        self.slotnpages += 1;
        self.generation = self.generation.wrapping_add(1);
        self.write_header()
    }

    /*** Initialization ***/

    fn init(&mut self) -> Result<()> {
        self.lock(true)?;
        let rc = self.init_internal();
        let _ = self.unlock(true);
        rc
    }

    fn init_internal(&mut self) -> Result<()> {
        if self.file.metadata()?.len() != 0 {
            return Ok(());
        }
        self.write_empty_slotpage(0)?;
        self.slotnpages = 1;
        if self.nextpkgidx == 0 {
            self.nextpkgidx = 1;
        }
        self.generation = self.generation.wrapping_add(1);
        self.write_header()
    }

    /*** Operations ***/

    fn get_internal(&mut self, pkgidx: u32) -> Result<Vec<u8>> {
        if self.slots.is_none() {
            self.read_slots()?;
        }
        let Some(idx) = self.find_slot(pkgidx) else {
            return Err(Error::NotFound);
        };
        let slot = self.slots.as_ref().expect("slot table not read")[idx];
        let (blob, _) = self.read_blob(pkgidx, slot.blkoff, slot.blkcnt)?;
        Ok(blob)
    }

    fn put_internal(&mut self, pkgidx: u32, blob: &[u8]) -> Result<()> {
        // always re-read all slots when writing, just in case
        self.read_slots()?;
        let blkcnt = blob_blkcnt(blob.len());
        let (mut blkoff, mut oldslot) = self.find_empty_offset(pkgidx, blkcnt, false)?;
        // create a new slot page if we have neither a free slot nor an old
        // one to reuse
        if oldslot.is_none() && self.freeslot == 0 {
            self.add_slot_page()?;
            (blkoff, oldslot) = self.find_empty_offset(pkgidx, blkcnt, false)?;
        }
        // make sure we are not overwriting data
        self.validate_zero(blkoff, blkcnt)?;
        self.write_blob(pkgidx, blkoff, blkcnt, blob, unix_now())?;
        let slotno = match oldslot {
            Some(i) => self.slots.as_ref().expect("slot table not read")[i].slotno,
            None => self.freeslot,
        };
        if slotno == 0 {
            return Err(corrupt(format!("{}: no free slot", self.path)));
        }
        if let Err(e) = self.write_slot(slotno, pkgidx, blkoff, blkcnt) {
            self.slots = None;
            return Err(e);
        }
        match oldslot {
            Some(i) => {
                let old = self.slots.as_ref().expect("slot table not read")[i];
                if old.blkoff != 0 {
                    if let Err(e) = self.del_blob(pkgidx, old.blkoff, old.blkcnt) {
                        self.slots = None;
                        return Err(e);
                    }
                }
                let slots = self.slots.as_mut().expect("slot table not read");
                slots[i].blkoff = blkoff;
                slots[i].blkcnt = blkcnt;
                self.slotorder = SlotOrder::Unordered;
            }
            None => self.slots = None,
        }
        Ok(())
    }

    fn del_internal(&mut self, pkgidx: u32) -> Result<()> {
        // always re-read all slots when writing, just in case
        self.read_slots()?;
        self.order_slots(SlotOrder::ByBlkoff);
        let Some(idx) = self.find_slot(pkgidx) else {
            return Ok(());
        };
        let slot = self.slots.as_ref().expect("slot table not read")[idx];
        self.write_slot(slot.slotno, 0, 0, 0)?;
        self.del_blob(pkgidx, slot.blkoff, slot.blkcnt)?;

        let nslots = self.slots.as_ref().expect("slot table not read").len();
        let datastart = self.slotnpages * BLKS_PER_PAGE;
        {
            let slots = self.slots.as_mut().expect("slot table not read");
            slots[idx].blkoff = 0;
            slots[idx].blkcnt = 0;
        }
        if nslots > 1 && slot.blkoff < datastart + (self.fileblks - datastart) / 2 {
            // we freed an extent in the first half of the data area; give the
            // two largest tail blobs a chance to drop into the free space
            let mut cands: Vec<(u32, u32)> = {
                let slots = self.slots.as_ref().expect("slot table not read");
                let mut live: Vec<&PkgSlot> = slots.iter().filter(|s| s.blkoff != 0).collect();
                live.sort_by_key(|s| s.blkoff);
                live.iter()
                    .rev()
                    .take(2)
                    .map(|s| (s.blkcnt, s.pkgidx))
                    .collect()
            };
            cands.sort_by(|a, b| b.0.cmp(&a.0)); // bigger blob first
            for (_, cpkgidx) in cands {
                self.slotorder = SlotOrder::Unordered;
                self.order_slots(SlotOrder::ByBlkoff);
                let Some(j) = self.find_slot(cpkgidx) else {
                    continue;
                };
                let s = self.slots.as_ref().expect("slot table not read")[j];
                if s.blkoff == 0 || s.blkoff * 2 < self.fileblks {
                    continue; // not a tail blob
                }
                let (newblkoff, old) = self.find_empty_offset(s.pkgidx, s.blkcnt, false)?;
                if old == Some(j) && newblkoff < s.blkoff {
                    self.move_blob(j, newblkoff)?;
                }
            }
        }
        self.slotorder = SlotOrder::Unordered;
        self.order_slots(SlotOrder::ByBlkoff);

        // check if we can truncate the file; free entries sort first, so the
        // last entry is the highest live blob if there is one
        let slots = self.slots.as_ref().expect("slot table not read");
        let last = &slots[nslots - 1];
        let blkoff = if last.blkoff != 0 {
            last.blkoff + last.blkcnt
        } else {
            datastart
        };
        if blkoff < self.fileblks / 4 * 3
            && self
                .validate_zero_check(blkoff, self.fileblks - blkoff)
                .is_ok()
            && self
                .file
                .set_len(blkoff as u64 * BLK_SIZE as u64)
                .is_ok()
        {
            self.fileblks = blkoff;
        }
        self.slots = None;
        Ok(())
    }

    fn list_internal(&mut self) -> Result<Vec<u32>> {
        if self.slots.is_none() {
            self.read_slots()?;
        }
        self.order_slots(SlotOrder::ByBlkoff);
        Ok(self
            .slots
            .as_ref()
            .expect("slot table not read")
            .iter()
            .map(|s| s.pkgidx)
            .collect())
    }

    /// Fetch the record for `pkgidx`. Fails with [`Error::NotFound`] if no
    /// live slot references it.
    pub fn get(&mut self, pkgidx: u32) -> Result<Vec<u8>> {
        if pkgidx == 0 {
            return Err(Error::InvalidArg("package id must be nonzero"));
        }
        self.lock_read_header(false)?;
        let rc = self.get_internal(pkgidx);
        let _ = self.unlock(false);
        #[cfg(feature = "blob-compress")]
        let rc = rc.and_then(|blob| codec::decompress(&blob));
        rc
    }

    /// Write or overwrite the record for `pkgidx`.
    pub fn put(&mut self, pkgidx: u32, blob: &[u8]) -> Result<()> {
        if pkgidx == 0 {
            return Err(Error::InvalidArg("package id must be nonzero"));
        }
        self.lock_read_header(true)?;
        #[cfg(feature = "blob-compress")]
        let blob = &codec::compress(blob);
        let rc = self.put_internal(pkgidx, blob);
        let _ = self.unlock(true);
        rc
    }

    /// Remove the record for `pkgidx`. Deleting an absent record succeeds.
    pub fn del(&mut self, pkgidx: u32) -> Result<()> {
        if pkgidx == 0 {
            return Err(Error::InvalidArg("package id must be nonzero"));
        }
        self.lock_read_header(true)?;
        let rc = self.del_internal(pkgidx);
        let _ = self.unlock(true);
        rc
    }

    /// All live package ids in block-offset order, a stable snapshot taken
    /// at call time.
    pub fn list(&mut self) -> Result<Vec<u32>> {
        self.lock_read_header(false)?;
        let rc = self.list_internal();
        let _ = self.unlock(false);
        rc
    }

    /// Hand out a fresh package id. The counter is persisted without fsync:
    /// it is re-read on every lock acquisition, and an id lost to a crash is
    /// harmless because ids only become visible through a synced `put`.
    pub fn next_pkg_idx(&mut self) -> Result<u32> {
        self.lock_read_header(true)?;
        let pkgidx = self.nextpkgidx;
        self.nextpkgidx = self.nextpkgidx.wrapping_add(1);
        // the generation stays untouched: the counter is re-read on every
        // lock acquisition anyway
        let dofsync = std::mem::replace(&mut self.dofsync, false);
        let rc = self.write_header();
        self.dofsync = dofsync;
        let _ = self.unlock(true);
        rc.map(|()| pkgidx)
    }

    pub fn generation(&mut self) -> Result<u32> {
        self.lock_read_header(false)?;
        let generation = self.generation;
        let _ = self.unlock(false);
        Ok(generation)
    }

    /// Verify the framing and checksum of every live blob.
    pub fn verify(&mut self) -> Result<()> {
        self.lock_read_header(false)?;
        let rc = (|| {
            self.read_slots()?;
            let slots = self.slots.as_ref().expect("slot table not read").clone();
            for slot in &slots {
                self.verify_blob(slot.pkgidx, slot.blkoff, slot.blkcnt)?;
            }
            Ok(())
        })();
        let _ = self.unlock(false);
        rc
    }

    pub fn stats(&mut self) -> Result<PkgDbStats> {
        self.lock_read_header(false)?;
        let rc = (|| {
            self.read_slots()?;
            let slots = self.slots.as_ref().expect("slot table not read");
            let usedblks: u64 = slots.iter().map(|s| s.blkcnt as u64).sum();
            Ok(PkgDbStats {
                path: self.path.clone(),
                generation: self.generation,
                slot_pages: self.slotnpages,
                used_slots: slots.len() as u32,
                free_slots: self.slotnpages * SLOTS_PER_PAGE - slots.len() as u32,
                blob_area_bytes: (self.fileblks as u64 - (self.slotnpages * BLKS_PER_PAGE) as u64)
                    * BLK_SIZE as u64,
                blob_used_bytes: usedblks * BLK_SIZE as u64,
            })
        })();
        let _ = self.unlock(false);
        rc
    }
}

impl Drop for PkgDb {
    fn drop(&mut self) {
        debug!("closed package db {}", self.path);
    }
}

pub(crate) fn fsync_dir(path: &Utf8Path) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_str().is_empty() => p,
        _ => Utf8Path::new("."),
    };
    File::open(dir.as_std_path())?.sync_all()?;
    Ok(())
}

#[cfg(feature = "blob-compress")]
mod codec {
    //! Optional zlib codec for package blobs. The compressed payload is
    //! framed with its own magic and the uncompressed length so that reads
    //! can reject blobs written without the codec.

    use std::io::{Read, Write};

    use byteorder::{ByteOrder, LittleEndian};

    use super::BLOBZ_MAGIC;
    use crate::error::{corrupt, Result};

    pub(super) fn compress(blob: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 8];
        LittleEndian::write_u32(&mut out[0..], BLOBZ_MAGIC);
        LittleEndian::write_u32(&mut out[4..], blob.len() as u32);
        let mut enc = flate2::write::ZlibEncoder::new(out, flate2::Compression::default());
        enc.write_all(blob).expect("writing to a Vec cannot fail");
        enc.finish().expect("writing to a Vec cannot fail")
    }

    pub(super) fn decompress(blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < 8 || LittleEndian::read_u32(&blob[0..]) != BLOBZ_MAGIC {
            return Err(corrupt("compressed blob framing missing"));
        }
        let rawlen = LittleEndian::read_u32(&blob[4..]) as usize;
        let mut out = Vec::with_capacity(rawlen);
        flate2::read::ZlibDecoder::new(&blob[8..])
            .read_to_end(&mut out)
            .map_err(|_| corrupt("compressed blob does not inflate"))?;
        if out.len() != rawlen {
            return Err(corrupt("compressed blob length mismatch"));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;

    fn open_db(dir: &Utf8TempDir) -> PkgDb {
        PkgDb::open(&dir.path().join("Packages.db"), true, false).unwrap()
    }

    #[test]
    fn open_fresh() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("Packages.db");
        let mut pkgdb = PkgDb::open(&path, true, false).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), PAGE_SIZE as u64);
        assert_eq!(pkgdb.generation().unwrap(), 1);
        assert_eq!(pkgdb.next_pkg_idx().unwrap(), 1);
        assert!(pkgdb.list().unwrap().is_empty());
    }

    #[test]
    #[cfg(not(feature = "blob-compress"))]
    fn put_get_single() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("Packages.db");
        let mut pkgdb = PkgDb::open(&path, true, false).unwrap();
        assert_eq!(pkgdb.next_pkg_idx().unwrap(), 1);
        pkgdb.put(1, b"hello").unwrap();
        assert_eq!(pkgdb.get(1).unwrap(), b"hello");
        assert_eq!(pkgdb.list().unwrap(), vec![1]);
        // one slot page plus one 48-byte blob extent (16 head + 5 payload
        // + 12 tail, rounded up to blocks)
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            PAGE_SIZE as u64 + 48
        );
    }

    #[test]
    fn get_absent() {
        let dir = Utf8TempDir::new().unwrap();
        let mut pkgdb = open_db(&dir);
        assert!(matches!(pkgdb.get(7), Err(Error::NotFound)));
        assert!(pkgdb.get(0).is_err());
    }

    #[test]
    fn overwrite_in_place() {
        let dir = Utf8TempDir::new().unwrap();
        let mut pkgdb = open_db(&dir);
        pkgdb.put(1, b"one").unwrap();
        pkgdb.put(1, b"two").unwrap();
        assert_eq!(pkgdb.get(1).unwrap(), b"two");
        assert_eq!(pkgdb.list().unwrap(), vec![1]);
    }

    #[test]
    #[cfg(not(feature = "blob-compress"))]
    fn rewrite_relocates() {
        let dir = Utf8TempDir::new().unwrap();
        let mut pkgdb = open_db(&dir);
        pkgdb.put(1, &[1u8; 5]).unwrap();
        pkgdb.put(2, &[2u8; 5]).unwrap();
        // no longer fits into its old 48-byte extent, must go above blob 2
        pkgdb.put(1, &[3u8; 4000]).unwrap();
        assert_eq!(pkgdb.list().unwrap(), vec![2, 1]);
        assert_eq!(pkgdb.get(1).unwrap(), vec![3u8; 4000]);
        assert_eq!(pkgdb.get(2).unwrap(), vec![2u8; 5]);
        // the freed extent right after the slot page is zero again
        pkgdb.lock(false).unwrap();
        pkgdb.validate_zero_check(BLKS_PER_PAGE, 3).unwrap();
        pkgdb.unlock(false).unwrap();
    }

    #[test]
    #[cfg(not(feature = "blob-compress"))]
    fn delete_compacts_and_truncates() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("Packages.db");
        let mut pkgdb = PkgDb::open(&path, true, false).unwrap();
        pkgdb.put(1, &[1u8; 5]).unwrap();
        pkgdb.put(2, &[2u8; 5]).unwrap();
        pkgdb.put(1, &[3u8; 4000]).unwrap();
        pkgdb.del(1).unwrap();
        // blob 2 was pulled down to the slot page boundary and the file
        // truncated to just past it
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            PAGE_SIZE as u64 + 48
        );
        assert_eq!(pkgdb.get(2).unwrap(), vec![2u8; 5]);
    }

    #[test]
    fn del_is_idempotent() {
        let dir = Utf8TempDir::new().unwrap();
        let mut pkgdb = open_db(&dir);
        pkgdb.put(1, b"payload").unwrap();
        pkgdb.del(1).unwrap();
        pkgdb.del(1).unwrap();
        assert!(matches!(pkgdb.get(1), Err(Error::NotFound)));
    }

    #[test]
    fn generation_strictly_increases() {
        let dir = Utf8TempDir::new().unwrap();
        let mut pkgdb = open_db(&dir);
        let g0 = pkgdb.generation().unwrap();
        pkgdb.put(1, b"a").unwrap();
        let g1 = pkgdb.generation().unwrap();
        assert!(g1 > g0);
        pkgdb.del(1).unwrap();
        let g2 = pkgdb.generation().unwrap();
        assert!(g2 > g1);
    }

    #[test]
    fn next_pkg_idx_is_monotonic() {
        let dir = Utf8TempDir::new().unwrap();
        let mut pkgdb = open_db(&dir);
        let a = pkgdb.next_pkg_idx().unwrap();
        let b = pkgdb.next_pkg_idx().unwrap();
        assert_eq!(b, a + 1);
    }

    #[test]
    fn reopen_preserves_contents() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("Packages.db");
        {
            let mut pkgdb = PkgDb::open(&path, true, false).unwrap();
            pkgdb.put(1, b"persist me").unwrap();
            pkgdb.next_pkg_idx().unwrap();
        }
        let mut pkgdb = PkgDb::open(&path, false, false).unwrap();
        assert_eq!(pkgdb.get(1).unwrap(), b"persist me");
        assert_eq!(pkgdb.next_pkg_idx().unwrap(), 2);
    }

    #[test]
    #[cfg(not(feature = "blob-compress"))]
    fn corrupted_blob_fails_get() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("Packages.db");
        let mut pkgdb = PkgDb::open(&path, true, false).unwrap();
        pkgdb.put(1, b"fragile").unwrap();
        // flip one payload byte behind the engine's back
        let blobstart = PAGE_SIZE as u64 + BLOBHEAD_SIZE as u64;
        let mut b = [0u8; 1];
        pkgdb.file.read_exact_at(&mut b, blobstart).unwrap();
        b[0] ^= 0xff;
        pkgdb.file.write_all_at(&b, blobstart).unwrap();
        assert!(matches!(pkgdb.get(1), Err(Error::Corrupt(_))));
        // the verify walk sees it too
        assert!(pkgdb.verify().is_err());
    }

    #[test]
    fn extents_stay_disjoint() {
        let dir = Utf8TempDir::new().unwrap();
        let mut pkgdb = open_db(&dir);
        for i in 1..40u32 {
            pkgdb.put(i, &vec![i as u8; (i * 13 % 300) as usize + 1]).unwrap();
        }
        for i in (1..40u32).step_by(3) {
            pkgdb.del(i).unwrap();
        }
        for i in (1..40u32).step_by(3) {
            pkgdb.put(i, &vec![0xaa; (i * 7 % 200) as usize + 1]).unwrap();
        }
        pkgdb.lock(false).unwrap();
        pkgdb.read_slots().unwrap();
        pkgdb.order_slots(SlotOrder::ByBlkoff);
        let slots = pkgdb.slots.as_ref().unwrap().clone();
        let mut lastend = pkgdb.slotnpages * BLKS_PER_PAGE;
        for s in &slots {
            assert!(s.blkoff >= lastend, "extents overlap");
            lastend = s.blkoff + s.blkcnt;
        }
        pkgdb.unlock(false).unwrap();
        for i in 1..40u32 {
            assert!(pkgdb.get(i).is_ok());
        }
    }

    #[test]
    fn lock_counts_nest() {
        let dir = Utf8TempDir::new().unwrap();
        let mut pkgdb = open_db(&dir);
        pkgdb.lock(true).unwrap();
        pkgdb.lock(false).unwrap(); // shared nests under exclusive
        pkgdb.lock(true).unwrap();
        pkgdb.unlock(true).unwrap();
        pkgdb.unlock(false).unwrap();
        pkgdb.unlock(true).unwrap();
        assert!(pkgdb.unlock(true).is_err()); // unbalanced
    }

    #[test]
    fn readonly_refuses_writes() {
        let dir = Utf8TempDir::new().unwrap();
        let path = dir.path().join("Packages.db");
        {
            let mut pkgdb = PkgDb::open(&path, true, false).unwrap();
            pkgdb.put(1, b"ro").unwrap();
        }
        let mut pkgdb = PkgDb::open(&path, false, true).unwrap();
        assert_eq!(pkgdb.get(1).unwrap(), b"ro");
        assert!(matches!(pkgdb.put(2, b"x"), Err(Error::ReadOnly)));
        assert!(matches!(pkgdb.del(1), Err(Error::ReadOnly)));
    }

    #[cfg(feature = "blob-compress")]
    #[test]
    fn compressed_round_trip() {
        let dir = Utf8TempDir::new().unwrap();
        let mut pkgdb = open_db(&dir);
        let blob = vec![7u8; 10000];
        pkgdb.put(1, &blob).unwrap();
        assert_eq!(pkgdb.get(1).unwrap(), blob);
    }
}
