//!
//! Shared-file memory mappings with explicit accessors.
//!
//! The mapped regions alias file contents that can be rewritten, relocated
//! or truncated while a mapping exists, so no plain references into the
//! mapping are ever handed out long-term. Instead, [`BlobView`] is a small
//! `Copy` window (pointer and length) with explicit little-endian accessors;
//! a view is valid only until the owning [`Mapping`] is resized, replaced or
//! dropped, which is exactly the contract the blob-store relocation
//! callbacks expose to their clients.
//!
//! The database page size is independent of the system page size; mappings
//! round their file window down to a system page boundary and remember the
//! shift.
//!

use std::fs::File;

use memmap2::{MmapOptions, MmapRaw};

use crate::error::Result;

pub(crate) fn system_page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

/// An owned shared mapping of a window of a file.
pub(crate) struct Mapping {
    raw: MmapRaw,
    /// start of the logical window inside the mapping; nonzero when the file
    /// offset is not system-page aligned
    shift: usize,
    len: usize,
}

impl Mapping {
    /// Map `len` bytes at file `offset`. The mapping is shared, so stores
    /// through a writable mapping reach the file.
    pub fn new(file: &File, offset: u64, len: usize, writable: bool) -> Result<Mapping> {
        let syspage = system_page_size();
        let shift = offset as usize & (syspage - 1);
        let mapoff = offset - shift as u64;
        let maplen = (len + shift + syspage - 1) & !(syspage - 1);
        let mut opts = MmapOptions::new();
        opts.offset(mapoff).len(maplen);
        let raw = if writable {
            opts.map_raw(file)?
        } else {
            opts.map_raw_read_only(file)?
        };
        Ok(Mapping { raw, shift, len })
    }

    /// The current window. The returned view aliases this mapping and must
    /// not be used after the mapping is dropped or replaced.
    pub fn view(&self) -> BlobView {
        BlobView {
            // SAFETY: shift < system page size <= mapping length
            ptr: unsafe { self.raw.as_mut_ptr().add(self.shift) },
            len: self.len,
        }
    }
}

/// A raw window into a mapped blob.
///
/// Bounds are asserted on every access. All multi-byte accessors are
/// little-endian and unaligned-safe. The window stays valid until its
/// mapping is resized, relocated, unmapped or dropped; holders are told
/// about those events through the relocation callback and must discard the
/// old view then.
#[derive(Clone, Copy, Debug)]
pub struct BlobView {
    ptr: *mut u8,
    len: usize,
}

impl BlobView {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn get_u32(&self, off: usize) -> u32 {
        assert!(off + 4 <= self.len);
        // SAFETY: in bounds per the assert, readable for the view's lifetime
        u32::from_le(unsafe { (self.ptr.add(off) as *const u32).read_unaligned() })
    }

    pub fn put_u32(&self, off: usize, val: u32) {
        assert!(off + 4 <= self.len);
        // SAFETY: in bounds per the assert, writable for the view's lifetime
        unsafe { (self.ptr.add(off) as *mut u32).write_unaligned(val.to_le()) }
    }

    pub fn read(&self, off: usize, out: &mut [u8]) {
        assert!(off + out.len() <= self.len);
        // SAFETY: in bounds per the assert, no overlap with `out`
        unsafe { std::ptr::copy_nonoverlapping(self.ptr.add(off), out.as_mut_ptr(), out.len()) }
    }

    pub fn write(&self, off: usize, data: &[u8]) {
        assert!(off + data.len() <= self.len);
        // SAFETY: in bounds per the assert, no overlap with `data`
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.add(off), data.len()) }
    }

    pub fn fill_zero(&self, off: usize, len: usize) {
        assert!(off + len <= self.len);
        // SAFETY: in bounds per the assert
        unsafe { std::ptr::write_bytes(self.ptr.add(off), 0, len) }
    }

    /// Borrow a byte range. The borrow must end before anything can remap
    /// the underlying blob (in particular before any resize).
    pub fn bytes(&self, off: usize, len: usize) -> &[u8] {
        assert!(off + len <= self.len);
        // SAFETY: in bounds per the assert, valid for the view's lifetime
        unsafe { std::slice::from_raw_parts(self.ptr.add(off), len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn mapping_round_trips() {
        let dir = camino_tempfile::Utf8TempDir::new().unwrap();
        let path = dir.path().join("mapped");
        let mut f = File::create(&path).unwrap();
        f.write_all(&[0u8; 8192]).unwrap();
        let f = File::options().read(true).write(true).open(&path).unwrap();
        let map = Mapping::new(&f, 0, 8192, true).unwrap();
        let view = map.view();
        view.put_u32(4096, 0xdeadbeef);
        view.write(100, b"abc");
        assert_eq!(view.get_u32(4096), 0xdeadbeef);
        assert_eq!(view.bytes(100, 3), b"abc");
        drop(map);
        // stores went through to the file
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents[100..103], b"abc");
        assert_eq!(
            u32::from_le_bytes(contents[4096..4100].try_into().unwrap()),
            0xdeadbeef
        );
    }
}
