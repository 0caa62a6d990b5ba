//! Memory-mapped files.
//!
//! `mmap` carves a byte range of a file into lazily loaded file pages;
//! the mapping holds its own reopened handle so that the caller closing
//! its descriptor does not tear the mapping down. Dirty pages are written
//! back to the file at `munmap` (and at exit); clean pages induce no file
//! I/O. Only the bytes a page actually mirrors (`read_bytes`) ever reach
//! the file, so a short final page never extends it.

use alloc::sync::Arc;
use core::cmp;

use crate::{
    addr::{VirtAddr, is_page_aligned},
    error::VmError,
    layout::{KERN_BASE, PAGE_SIZE},
    page::{FileSegment, PageInit, PageType},
    vm::{Platform, Vm},
};

/// The file-layer contract the mmap backend consumes.
///
/// Closing a handle is dropping it; the mapping keeps its reopened
/// handle alive exactly as long as any of its pages exist.
pub trait MappedFile: Sized {
    /// Opens an independent handle onto the same file.
    fn reopen(&self) -> Result<Self, VmError>;

    /// Current length of the file in bytes.
    fn len(&self) -> Result<u64, VmError>;

    /// Reads up to `buf.len()` bytes at `offset`, returning how many
    /// were read. Short reads happen at end of file.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, VmError>;

    /// Writes all of `buf` at `offset`, returning how many bytes were
    /// written.
    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, VmError>;
}

/// Reads a segment into a freshly claimed frame, zeroing the tail.
pub(crate) fn load<F>(segment: &FileSegment<F>, buf: &mut [u8; PAGE_SIZE]) -> Result<(), VmError>
where
    F: MappedFile,
{
    let n = segment
        .file
        .read_at(&mut buf[..segment.read_bytes], segment.offset)?;
    if n != segment.read_bytes {
        return Err(VmError::FileIo);
    }
    buf[segment.read_bytes..].fill(0);
    Ok(())
}

/// Writes the mirrored bytes of a frame back at the segment's offset.
pub(crate) fn write_back<F>(segment: &FileSegment<F>, buf: &[u8; PAGE_SIZE]) -> Result<(), VmError>
where
    F: MappedFile,
{
    let n = segment
        .file
        .write_at(&buf[..segment.read_bytes], segment.offset)?;
    if n != segment.read_bytes {
        return Err(VmError::FileIo);
    }
    Ok(())
}

/// One live mapping, recorded so `munmap` can validate its argument and
/// exit can account for leftovers.
#[derive(Debug, Clone)]
pub(crate) struct MmapRegion {
    pub(crate) base: VirtAddr,
    pub(crate) length: usize,
}

impl<P: Platform> Vm<P> {
    /// Maps `length` bytes of `file` starting at `offset` into the range
    /// beginning at `addr`, lazily. Returns the base address.
    ///
    /// `addr` must be page-aligned and non-null, `length` non-zero, the
    /// whole range in user space and free of existing pages, and the
    /// file non-empty.
    pub fn mmap(
        &mut self,
        addr: usize,
        length: usize,
        writable: bool,
        file: &P::File,
        offset: u64,
    ) -> Result<VirtAddr, VmError> {
        if addr == 0 || !is_page_aligned(addr) || length == 0 {
            return Err(VmError::BadMmap(addr));
        }
        let end = addr.checked_add(length).ok_or(VmError::BadMmap(addr))?;
        if end > KERN_BASE {
            return Err(VmError::BadMmap(addr));
        }
        if file.len()? == 0 {
            return Err(VmError::BadMmap(addr));
        }

        let base = VirtAddr::new(addr);
        let page_count = length.div_ceil(PAGE_SIZE);
        for i in 0..page_count {
            let va = base.byte_add(i * PAGE_SIZE);
            if self.table.find(va).is_some() {
                return Err(VmError::AlreadyMapped(va));
            }
        }

        let handle = Arc::new(file.reopen()?);
        let mut remaining = length;
        for i in 0..page_count {
            let va = base.byte_add(i * PAGE_SIZE);
            let read_bytes = cmp::min(PAGE_SIZE, remaining);
            let segment = FileSegment::new(
                Arc::clone(&handle),
                offset + (i * PAGE_SIZE) as u64,
                read_bytes,
                length,
            );
            self.alloc_page_with_initializer(
                PageType::File,
                va,
                writable,
                PageInit::FromFile(segment),
            )?;
            remaining -= read_bytes;
        }
        self.regions.push(MmapRegion { base, length });
        log::debug!("mmap {length} bytes at {base:#x}");
        Ok(base)
    }

    /// Removes the mapping previously established at `base`. Pages whose
    /// hardware dirty bit is set are written back to the file; untouched
    /// and clean pages are simply dropped. The mapping's file handle
    /// closes once its last page is gone.
    pub fn munmap(&mut self, base: VirtAddr) -> Result<(), VmError> {
        let region = self
            .regions
            .iter()
            .position(|r| r.base == base)
            .ok_or(VmError::NotMapped(base))?;
        let length = self
            .table
            .find(base)
            .and_then(|page| page.mapping_len())
            .ok_or(VmError::NotMapped(base))?;
        debug_assert_eq!(self.regions[region].length, length);

        let page_count = length.div_ceil(PAGE_SIZE);
        for i in 0..page_count {
            self.remove_page(base.byte_add(i * PAGE_SIZE))?;
        }
        self.regions.swap_remove(region);
        log::debug!("munmap {length} bytes at {base:#x}");
        Ok(())
    }
}
