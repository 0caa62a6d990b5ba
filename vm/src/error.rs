use crate::addr::VirtAddr;

/// Failures surfaced by the virtual-memory core.
///
/// Public entry points report these to the process layer, which turns an
/// unhandled fault into a segmentation-fault signal and an allocation
/// failure into process termination. Nothing is retried implicitly, and
/// teardown paths never fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("null address dereference")]
    NullAddress,
    #[error("kernel half-space address: {0:#x}")]
    KernelAddress(usize),
    #[error("protection violation on a present page")]
    ProtectionFault,
    #[error("no mapping covers {0:#x}")]
    NotMapped(VirtAddr),
    #[error("page already mapped at {0:#x}")]
    AlreadyMapped(VirtAddr),
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("swap device full")]
    SwapFull,
    #[error("swap device I/O failed")]
    DiskIo,
    #[error("backing file I/O failed")]
    FileIo,
    #[error("bad mmap request at {0:#x}")]
    BadMmap(usize),
    #[error("stack limit exceeded at {0:#x}")]
    StackLimit(usize),
}
