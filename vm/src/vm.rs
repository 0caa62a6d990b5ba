//! The VM dispatcher.
//!
//! [`Vm`] is the per-process virtual-memory image: the supplemental page
//! table, the frame table with its FIFO eviction queue, the hardware page
//! table, and the list of live file mappings. Faults enter through
//! [`Vm::try_handle_fault`]; everything else (lazy allocation, claiming,
//! stack growth, fork, exit) hangs off the same struct.

use alloc::{sync::Arc, vec::Vec};
use core::{mem, ops::DerefMut, ptr::NonNull};

use bitmap::Bitmap;
use sync_api::Mutex;

use crate::{
    addr::{PageRound as _, VirtAddr},
    anon::{SectorDevice, SwapDevice},
    error::VmError,
    file::{self, MappedFile, MmapRegion},
    frame::{FrameId, FrameTable},
    layout::{KERN_BASE, MAX_STACK_SIZE, PAGE_SIZE, USER_STACK},
    page::{FileSegment, Page, PageInit, PageState, PageType},
    spt::SupplementalPageTable,
};

/// The hardware page-table contract.
///
/// Mutations must be visible to the owning address space before the call
/// returns; the eviction protocol relies on the victim's entry being gone
/// before its frame is handed to the next page.
pub trait AddressMapper {
    /// Installs a mapping from `va` to the physical page behind `kva`
    /// with the given write permission.
    fn set_page(&mut self, va: VirtAddr, kva: NonNull<u8>, writable: bool) -> Result<(), VmError>;

    /// Removes the entry for `va`. Absent entries are ignored.
    fn clear_page(&mut self, va: VirtAddr);

    /// Whether `va` has been stored through since its dirty bit was last
    /// cleared.
    fn is_dirty(&self, va: VirtAddr) -> bool;

    fn set_dirty(&mut self, va: VirtAddr, dirty: bool);
}

/// The services the VM core consumes from the surrounding kernel,
/// bundled so that [`Vm`] takes a single type parameter.
pub trait Platform {
    /// A process's hardware page table.
    type Mapper: AddressMapper;

    /// The swap disk.
    type Disk: SectorDevice;

    /// An open file handle as given out by the file layer.
    type File: MappedFile;

    /// The lock protecting the swap slot bitmap.
    type SlotLock: Mutex<Data = Bitmap>;

    /// One page of kernel-addressable memory from the user pool.
    type PageBuf: DerefMut<Target = [u8; PAGE_SIZE]>;

    /// Allocates one zero-filled page from the user pool, or `None` when
    /// the pool is exhausted. Exhaustion is what triggers eviction.
    fn alloc_user_page(&self) -> Option<Self::PageBuf>;
}

/// Snapshot of a page fault, taken once at trap entry.
///
/// `user_rsp` is the saved user stack pointer of the faulting context,
/// even when the fault itself was taken in kernel mode. The stack-growth
/// decision reads this snapshot and never re-samples it.
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    /// The faulting virtual address, unrounded.
    pub addr: usize,
    /// Whether the access came from user mode.
    pub user: bool,
    /// Whether the access was a write.
    pub write: bool,
    /// Whether the fault was taken on a non-present entry (as opposed to
    /// a protection violation on a present one).
    pub not_present: bool,
    /// The user stack pointer at fault entry.
    pub user_rsp: usize,
}

/// The per-process virtual-memory image.
pub struct Vm<P: Platform> {
    platform: Arc<P>,
    swap: Arc<SwapDevice<P::Disk, P::SlotLock>>,
    mapper: P::Mapper,
    pub(crate) table: SupplementalPageTable<P::File>,
    pub(crate) frames: FrameTable<P::PageBuf>,
    pub(crate) regions: Vec<MmapRegion>,
}

impl<P: Platform> Vm<P> {
    pub fn new(
        platform: Arc<P>,
        swap: Arc<SwapDevice<P::Disk, P::SlotLock>>,
        mapper: P::Mapper,
    ) -> Self {
        Self {
            platform,
            swap,
            mapper,
            table: SupplementalPageTable::new(),
            frames: FrameTable::new(),
            regions: Vec::new(),
        }
    }

    pub fn mapper(&self) -> &P::Mapper {
        &self.mapper
    }

    pub fn mapper_mut(&mut self) -> &mut P::Mapper {
        &mut self.mapper
    }

    pub fn pages(&self) -> &SupplementalPageTable<P::File> {
        &self.table
    }

    /// Resident pages in eviction order, oldest victim candidate first.
    pub fn eviction_order(&self) -> impl Iterator<Item = VirtAddr> + '_ {
        self.frames.queue_order().map(|id| {
            self.frames
                .get(id)
                .page()
                .expect("queued frame without a page")
        })
    }

    /// Kernel view of the contents of a resident page, as the syscall
    /// layer uses for user-memory copies.
    pub fn resident_bytes(&self, va: VirtAddr) -> Option<&[u8; PAGE_SIZE]> {
        let id = self.table.find(va)?.frame()?;
        Some(self.frames.get(id).bytes())
    }

    pub fn resident_bytes_mut(&mut self, va: VirtAddr) -> Option<&mut [u8; PAGE_SIZE]> {
        let id = self.table.find(va)?.frame()?;
        Some(self.frames.get_mut(id).bytes_mut())
    }

    /// Registers a lazy page at `va` with a pending initializer. `ty` is
    /// the type the page will assume on first touch, never
    /// uninitialized. If a page already covers `va` this is a no-op that
    /// succeeds.
    ///
    /// # Panics
    ///
    /// Panics if a file-typed page is requested without a file segment.
    pub fn alloc_page_with_initializer(
        &mut self,
        ty: PageType,
        va: VirtAddr,
        writable: bool,
        init: PageInit<P::File>,
    ) -> Result<(), VmError> {
        assert!(
            !(ty == PageType::File && matches!(init, PageInit::Zeroed)),
            "file pages need a file segment"
        );
        let va = va.page_rounddown();
        if self.table.find(va).is_some() {
            return Ok(());
        }
        self.table.insert(Page::new_uninit(va, writable, ty, init))
    }

    /// Registers a lazy zero-filled page at `va`.
    pub fn alloc_page(&mut self, ty: PageType, va: VirtAddr, writable: bool) -> Result<(), VmError> {
        self.alloc_page_with_initializer(ty, va, writable, PageInit::Zeroed)
    }

    /// Binds the page at `va` to a frame and installs its mapping.
    pub fn claim_page(&mut self, va: VirtAddr) -> Result<(), VmError> {
        let va = va.page_rounddown();
        if self.table.find(va).is_none() {
            return Err(VmError::NotMapped(va));
        }
        self.do_claim(va)
    }

    fn do_claim(&mut self, va: VirtAddr) -> Result<(), VmError> {
        let page = self.table.find(va).expect("claim of an untracked page");
        if page.is_resident() {
            return Ok(());
        }
        let writable = page.writable();

        let id = self.get_frame()?;

        // Link the pair, then expose the mapping.
        self.frames.get_mut(id).bind_page(va);
        self.table.find_mut(va).unwrap().bind_frame(id);
        let kva = NonNull::from(&mut self.frames.get_mut(id).bytes_mut()[0]);
        if let Err(e) = self.mapper.set_page(va, kva, writable) {
            self.table.find_mut(va).unwrap().unbind_frame();
            self.frames.release(id);
            return Err(e);
        }
        self.frames.enqueue(id);

        if let Err(e) = self.populate(va, id) {
            self.discard_binding(va, id);
            return Err(e);
        }
        Ok(())
    }

    /// Variant-specific population of a freshly bound frame.
    fn populate(&mut self, va: VirtAddr, id: FrameId) -> Result<(), VmError> {
        let page = self.table.find_mut(va).unwrap();
        if matches!(page.state(), PageState::Uninit { .. }) {
            return self.first_touch(va, id);
        }
        let frame = self.frames.get_mut(id);
        match page.state_mut() {
            PageState::Anon { slot } => {
                if let Some(s) = slot.take() {
                    self.swap.read_page(s, frame.bytes_mut())?;
                    self.swap.release(s);
                    log::trace!("swapped in {va:#x} from slot {}", s.index());
                }
                // A never-evicted page keeps the zero fill it arrived with.
            }
            PageState::File { segment } => {
                file::load(segment, frame.bytes_mut())?;
                self.mapper.set_dirty(va, false);
            }
            PageState::Uninit { .. } => unreachable!(),
        }
        Ok(())
    }

    /// One-shot transition of an uninitialized page to its intended type.
    /// The transition is never reverted, even when the initializer fails.
    fn first_touch(&mut self, va: VirtAddr, id: FrameId) -> Result<(), VmError> {
        let page = self.table.find_mut(va).unwrap();
        let PageState::Uninit { ty, init } =
            mem::replace(page.state_mut(), PageState::Anon { slot: None })
        else {
            unreachable!("first touch of an initialized page");
        };
        let frame = self.frames.get_mut(id);
        match (ty, init) {
            (PageType::Anon, PageInit::Zeroed) => {
                // The frame arrives zero-filled.
            }
            (PageType::Anon, PageInit::FromFile(segment)) => {
                file::load(&segment, frame.bytes_mut())?;
                self.mapper.set_dirty(va, false);
            }
            (PageType::File, PageInit::FromFile(segment)) => {
                file::load(&segment, frame.bytes_mut())?;
                self.mapper.set_dirty(va, false);
                page.set_state(PageState::File { segment });
            }
            (PageType::File, PageInit::Zeroed) => {
                unreachable!("file page without a file segment")
            }
        }
        Ok(())
    }

    /// Unwinds a claim whose population step failed.
    fn discard_binding(&mut self, va: VirtAddr, id: FrameId) {
        self.mapper.clear_page(va);
        self.table.find_mut(va).unwrap().unbind_frame();
        self.frames.release(id);
    }

    /// Obtains a frame, evicting the oldest resident page when the user
    /// pool is exhausted.
    fn get_frame(&mut self) -> Result<FrameId, VmError> {
        if let Some(buf) = self.platform.alloc_user_page() {
            return Ok(self.frames.adopt(buf));
        }
        self.evict_frame()
    }

    /// Evicts the FIFO victim and returns its now-empty frame. A victim
    /// that cannot be swapped out goes back on the queue and the
    /// allocation fails.
    fn evict_frame(&mut self) -> Result<FrameId, VmError> {
        let id = self.frames.pop_victim().ok_or(VmError::OutOfMemory)?;
        let va = self
            .frames
            .get(id)
            .page()
            .expect("queued frame without a page");
        match self.swap_out(va, id) {
            Ok(()) => {
                log::trace!("evicted {va:#x}");
                Ok(id)
            }
            Err(e) => {
                self.frames.requeue(id);
                Err(e)
            }
        }
    }

    /// Pushes the resident page at `va` out of its frame: anonymous
    /// contents go to a swap slot, dirty file contents back to the file.
    fn swap_out(&mut self, va: VirtAddr, id: FrameId) -> Result<(), VmError> {
        let page = self
            .table
            .find_mut(va)
            .expect("frame bound to an untracked page");
        let frame = self.frames.get_mut(id);
        match page.state_mut() {
            PageState::Anon { slot } => {
                debug_assert!(slot.is_none());
                let s = self.swap.allocate()?;
                if let Err(e) = self.swap.write_page(s, frame.bytes()) {
                    self.swap.release(s);
                    return Err(e);
                }
                *slot = Some(s);
                log::trace!("swapped out {va:#x} to slot {}", s.index());
            }
            PageState::File { segment } => {
                if self.mapper.is_dirty(va) {
                    file::write_back(segment, frame.bytes())?;
                    self.mapper.set_dirty(va, false);
                }
            }
            PageState::Uninit { .. } => {
                unreachable!("uninitialized page in the eviction queue")
            }
        }
        frame.bytes_mut().fill(0);
        self.mapper.clear_page(va);
        self.mapper.set_dirty(va, false);
        page.unbind_frame();
        frame.unbind_page();
        Ok(())
    }

    /// Services a page fault. `Ok(())` means the access can be retried;
    /// an error means the caller delivers a segmentation fault.
    pub fn try_handle_fault(&mut self, fault: &PageFault) -> Result<(), VmError> {
        if fault.addr == 0 {
            return Err(VmError::NullAddress);
        }
        if fault.addr >= KERN_BASE {
            return Err(VmError::KernelAddress(fault.addr));
        }
        if !fault.not_present {
            // Write-protection recovery is not supported; a protection
            // fault on a present page is fatal to the process.
            return Err(VmError::ProtectionFault);
        }

        let va = VirtAddr::new(fault.addr).page_rounddown();
        if self.table.find(va).is_some() {
            return self.do_claim(va);
        }

        // No descriptor covers the address; the remaining legitimate
        // cause is an access just below the live stack.
        let Some(probe) = fault.user_rsp.checked_sub(8) else {
            return Err(VmError::NotMapped(va));
        };
        if probe <= fault.addr && fault.addr < USER_STACK && USER_STACK - probe <= MAX_STACK_SIZE {
            return self.stack_growth(fault.addr);
        }
        Err(VmError::NotMapped(va))
    }

    /// Grows the stack by exactly one anonymous writable page covering
    /// `addr`. Each further page faults and re-enters on its own.
    pub fn stack_growth(&mut self, addr: usize) -> Result<(), VmError> {
        let page_addr = addr.page_rounddown();
        if page_addr < USER_STACK - MAX_STACK_SIZE || page_addr >= USER_STACK {
            return Err(VmError::StackLimit(addr));
        }
        let va = VirtAddr::new(page_addr);
        log::debug!("growing stack with page {va:#x}");
        self.alloc_page(PageType::Anon, va, true)?;
        self.claim_page(va)
    }

    /// Reproduces this address space in `child`, the fork half of the
    /// lifecycle. Uninitialized pages stay lazy in the child; everything
    /// else is claimed there and copied byte for byte. On failure the
    /// child keeps its partial progress for the caller to tear down.
    pub fn clone_into(&mut self, child: &mut Self) -> Result<(), VmError> {
        enum Plan<F> {
            Uninit(PageType, PageInit<F>),
            Anon,
            File(FileSegment<F>),
        }

        let vas: Vec<VirtAddr> = self.table.addresses().collect();
        for va in vas {
            let src = self.table.find(va).unwrap();
            let writable = src.writable();
            let plan = match src.state() {
                PageState::Uninit { ty, init } => Plan::Uninit(*ty, init.clone()),
                PageState::Anon { .. } => Plan::Anon,
                PageState::File { segment } => Plan::File(segment.clone()),
            };
            match plan {
                Plan::Uninit(ty, init) => {
                    child.alloc_page_with_initializer(ty, va, writable, init)?;
                }
                Plan::Anon => {
                    child.alloc_page(PageType::Anon, va, writable)?;
                    child.claim_page(va)?;
                    self.copy_frame_to(child, va)?;
                }
                Plan::File(segment) => {
                    child.alloc_page_with_initializer(
                        PageType::File,
                        va,
                        writable,
                        PageInit::FromFile(segment),
                    )?;
                    child.claim_page(va)?;
                    self.copy_frame_to(child, va)?;
                }
            }
        }
        child.regions.extend(self.regions.iter().cloned());
        Ok(())
    }

    /// Copies the current contents of `va` into the child's
    /// already-claimed frame, swapping the parent page back in first if
    /// it was evicted.
    fn copy_frame_to(&mut self, child: &mut Self, va: VirtAddr) -> Result<(), VmError> {
        if !self.table.find(va).unwrap().is_resident() {
            self.do_claim(va)?;
        }
        let src = self.table.find(va).unwrap().frame().unwrap();
        let dst = child.table.find(va).unwrap().frame().unwrap();
        *child.frames.get_mut(dst).bytes_mut() = *self.frames.get(src).bytes();
        Ok(())
    }

    /// Drops the page at `va`, releasing its frame, mapping, and swap
    /// slot. A dirty file page is written back first.
    pub fn remove_page(&mut self, va: VirtAddr) -> Result<(), VmError> {
        let va = va.page_rounddown();
        if self.table.find(va).is_none() {
            return Err(VmError::NotMapped(va));
        }
        self.sync_file_page(va)?;
        let page = self.table.remove(va).unwrap();
        self.drop_page_entry(page);
        Ok(())
    }

    /// Releases every page, frame, mapping, and swap slot this address
    /// space owns. The image stays usable (empty) afterwards; dropping
    /// the `Vm` runs this automatically. Hardware entries are cleared
    /// here, page by page, so the caller must not tear the hardware
    /// table down until this returns.
    pub fn destroy(&mut self) {
        let vas: Vec<VirtAddr> = self.table.addresses().collect();
        for va in vas {
            if let Err(e) = self.sync_file_page(va) {
                log::warn!("write-back of {va:#x} failed during teardown: {e}");
            }
            let page = self.table.remove(va).unwrap();
            self.drop_page_entry(page);
        }
        self.regions.clear();
        debug_assert!(self.frames.is_empty());
    }

    /// Writes a resident, dirty file page back to its backing file.
    pub(crate) fn sync_file_page(&mut self, va: VirtAddr) -> Result<(), VmError> {
        let page = self.table.find(va).unwrap();
        let Some(id) = page.frame() else {
            return Ok(());
        };
        if let PageState::File { segment } = page.state() {
            if self.mapper.is_dirty(va) {
                file::write_back(segment, self.frames.get(id).bytes())?;
                self.mapper.set_dirty(va, false);
            }
        }
        Ok(())
    }

    /// Final teardown of a page already removed from the table.
    fn drop_page_entry(&mut self, page: Page<P::File>) {
        if let Some(id) = page.frame() {
            self.mapper.clear_page(page.va());
            self.frames.release(id);
        }
        if let Some(slot) = page.swap_slot() {
            self.swap.release(slot);
        }
    }
}

impl<P: Platform> Drop for Vm<P> {
    fn drop(&mut self) {
        self.destroy();
    }
}
