//! Mock implementations of the kernel-side contracts, so the whole VM
//! core can be driven from host tests.

use std::{
    collections::HashMap,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use bitmap::Bitmap;
use osmium_vm::{
    AddressMapper, MappedFile, PageFault, Platform, SectorDevice, SwapDevice, VirtAddr, Vm,
    VmError,
    layout::{PAGE_SIZE, SECTOR_SIZE, SECTORS_PER_PAGE},
};
use sync_api::StdMutex;

pub fn va(addr: usize) -> VirtAddr {
    VirtAddr::new(addr)
}

/// A read access at `addr`. The stack pointer is parked at zero so the
/// fault can never be mistaken for stack growth.
pub fn read_fault(addr: usize) -> PageFault {
    PageFault {
        addr,
        user: true,
        write: false,
        not_present: true,
        user_rsp: 0,
    }
}

/// A write access below the stack pointer `rsp`.
pub fn stack_fault(addr: usize, rsp: usize) -> PageFault {
    PageFault {
        addr,
        user: true,
        write: true,
        not_present: true,
        user_rsp: rsp,
    }
}

/// One page borrowed from the mock user pool; returns itself on drop.
pub struct PoolPage {
    buf: Box<[u8; PAGE_SIZE]>,
    pool: Arc<AtomicUsize>,
}

impl Deref for PoolPage {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PoolPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PoolPage {
    fn drop(&mut self) {
        self.pool.fetch_add(1, Ordering::Relaxed);
    }
}

/// A user pool with a fixed number of pages.
pub struct MockPlatform {
    free: Arc<AtomicUsize>,
}

impl MockPlatform {
    pub fn new(pool_pages: usize) -> Self {
        Self {
            free: Arc::new(AtomicUsize::new(pool_pages)),
        }
    }

    pub fn free_pages(&self) -> usize {
        self.free.load(Ordering::Relaxed)
    }
}

impl Platform for MockPlatform {
    type Mapper = MockMapper;
    type Disk = MockDisk;
    type File = MockFile;
    type SlotLock = StdMutex<Bitmap>;
    type PageBuf = PoolPage;

    fn alloc_user_page(&self) -> Option<PoolPage> {
        self.free
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .ok()?;
        Some(PoolPage {
            buf: Box::new([0; PAGE_SIZE]),
            pool: Arc::clone(&self.free),
        })
    }
}

struct MapEntry {
    #[expect(dead_code)]
    kva: usize,
    writable: bool,
    dirty: bool,
}

/// An in-memory stand-in for the hardware page table.
#[derive(Default)]
pub struct MockMapper {
    entries: HashMap<usize, MapEntry>,
}

impl MockMapper {
    pub fn is_present(&self, va: VirtAddr) -> bool {
        self.entries.contains_key(&va.addr())
    }

    pub fn is_writable(&self, va: VirtAddr) -> bool {
        self.entries.get(&va.addr()).is_some_and(|e| e.writable)
    }
}

impl AddressMapper for MockMapper {
    fn set_page(&mut self, va: VirtAddr, kva: NonNull<u8>, writable: bool) -> Result<(), VmError> {
        self.entries.insert(
            va.addr(),
            MapEntry {
                kva: kva.as_ptr().addr(),
                writable,
                dirty: false,
            },
        );
        Ok(())
    }

    fn clear_page(&mut self, va: VirtAddr) {
        self.entries.remove(&va.addr());
    }

    fn is_dirty(&self, va: VirtAddr) -> bool {
        self.entries.get(&va.addr()).is_some_and(|e| e.dirty)
    }

    fn set_dirty(&mut self, va: VirtAddr, dirty: bool) {
        if let Some(entry) = self.entries.get_mut(&va.addr()) {
            entry.dirty = dirty;
        }
    }
}

/// An in-memory swap disk.
pub struct MockDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
}

impl MockDisk {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; sector_count]),
        }
    }
}

impl SectorDevice for MockDisk {
    fn sector_count(&self) -> usize {
        self.sectors.lock().unwrap().len()
    }

    fn read_sector(&self, sector: usize, buf: &mut [u8; SECTOR_SIZE]) -> Result<(), VmError> {
        buf.copy_from_slice(&self.sectors.lock().unwrap()[sector]);
        Ok(())
    }

    fn write_sector(&self, sector: usize, buf: &[u8; SECTOR_SIZE]) -> Result<(), VmError> {
        self.sectors.lock().unwrap()[sector].copy_from_slice(buf);
        Ok(())
    }
}

/// An in-memory file that counts its I/O calls.
#[derive(Clone)]
pub struct MockFile {
    data: Arc<Mutex<Vec<u8>>>,
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl MockFile {
    pub fn new(contents: &[u8]) -> Self {
        Self {
            data: Arc::new(Mutex::new(contents.to_vec())),
            reads: Arc::new(AtomicUsize::new(0)),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

impl MappedFile for MockFile {
    fn reopen(&self) -> Result<Self, VmError> {
        Ok(self.clone())
    }

    fn len(&self) -> Result<u64, VmError> {
        Ok(self.data.lock().unwrap().len() as u64)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, VmError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.lock().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> Result<usize, VmError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.lock().unwrap();
        let offset = offset as usize;
        let end = offset + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }
}

pub type TestSwap = SwapDevice<MockDisk, StdMutex<Bitmap>>;
pub type TestVm = Vm<MockPlatform>;

/// Shared kernel-side state: the user pool and the swap device.
pub struct TestKernel {
    pub platform: Arc<MockPlatform>,
    pub swap: Arc<TestSwap>,
}

impl TestKernel {
    pub fn new(pool_pages: usize, swap_slots: usize) -> Self {
        Self {
            platform: Arc::new(MockPlatform::new(pool_pages)),
            swap: Arc::new(TestSwap::new(MockDisk::new(swap_slots * SECTORS_PER_PAGE))),
        }
    }

    /// A fresh process image on this kernel.
    pub fn spawn(&self) -> TestVm {
        Vm::new(
            Arc::clone(&self.platform),
            Arc::clone(&self.swap),
            MockMapper::default(),
        )
    }
}

/// Every resident page must sit in the eviction queue exactly once, and
/// every queued frame must point back at a resident page.
pub fn assert_queue_invariant(vm: &TestVm) {
    let queued: Vec<VirtAddr> = vm.eviction_order().collect();
    for &qva in &queued {
        assert_eq!(
            queued.iter().filter(|&&v| v == qva).count(),
            1,
            "page {qva:#x} queued more than once"
        );
        assert!(
            vm.pages().find(qva).is_some_and(|p| p.is_resident()),
            "queued page {qva:#x} is not resident"
        );
    }
    let resident = vm.pages().iter().filter(|p| p.is_resident()).count();
    assert_eq!(resident, queued.len(), "resident page missing from queue");
}
