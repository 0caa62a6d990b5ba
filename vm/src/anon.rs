//! The swap backend for anonymous pages.
//!
//! The swap device is carved into page-sized slots of
//! [`SECTORS_PER_PAGE`] sectors each, tracked by one bit per slot. The
//! slot bitmap is the only structure in the subsystem shared by every
//! process, so it sits behind a mutex; the find-first-clear allocation is
//! atomic with respect to concurrent evictions.

use bitmap::Bitmap;
use sync_api::Mutex;

use crate::{
    error::VmError,
    layout::{PAGE_SIZE, SECTOR_SIZE, SECTORS_PER_PAGE},
};

/// The disk contract the swap backend consumes: 512-byte sector reads and
/// writes. Implementations serialize access internally.
pub trait SectorDevice {
    /// Total number of sectors on the device.
    fn sector_count(&self) -> usize;

    fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), VmError>;

    fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) -> Result<(), VmError>;
}

/// An occupied slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(u32);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    fn first_sector(self) -> usize {
        self.index() * SECTORS_PER_PAGE
    }
}

/// The swap device shared by all processes.
pub struct SwapDevice<D, M> {
    disk: D,
    slots: M,
}

impl<D, M> SwapDevice<D, M>
where
    D: SectorDevice,
    M: Mutex<Data = Bitmap>,
{
    /// Wraps `disk` as a swap device. The slot count is fixed at
    /// construction from the device size.
    pub fn new(disk: D) -> Self {
        let slot_count = disk.sector_count() / SECTORS_PER_PAGE;
        Self {
            disk,
            slots: M::new(Bitmap::new(slot_count)),
        }
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Number of currently unoccupied slots.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        let slots = self.slots.lock();
        slots.len() - slots.count_set()
    }

    /// Whether `slot` is currently occupied.
    #[must_use]
    pub fn is_in_use(&self, slot: SwapSlot) -> bool {
        self.slots.lock().test(slot.index())
    }

    /// Claims the first free slot.
    pub fn allocate(&self) -> Result<SwapSlot, VmError> {
        let index = self.slots.lock().scan_and_set().ok_or(VmError::SwapFull)?;
        Ok(SwapSlot(index as u32))
    }

    /// Releases an occupied slot.
    pub fn release(&self, slot: SwapSlot) {
        let mut slots = self.slots.lock();
        debug_assert!(slots.test(slot.index()));
        slots.clear(slot.index());
    }

    /// Writes one page into `slot`.
    pub fn write_page(&self, slot: SwapSlot, buf: &[u8; PAGE_SIZE]) -> Result<(), VmError> {
        let base = slot.first_sector();
        for (i, chunk) in buf.chunks_exact(SECTOR_SIZE).enumerate() {
            self.disk.write_sector(base + i, chunk.try_into().unwrap())?;
        }
        Ok(())
    }

    /// Reads one page out of `slot`.
    pub fn read_page(&self, slot: SwapSlot, buf: &mut [u8; PAGE_SIZE]) -> Result<(), VmError> {
        let base = slot.first_sector();
        for (i, chunk) in buf.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.disk.read_sector(base + i, chunk.try_into().unwrap())?;
        }
        Ok(())
    }
}
