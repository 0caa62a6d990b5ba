//! Virtual-memory core of the Osmium teaching kernel.
//!
//! Every user page starts life as a lazy [`page::PageState::Uninit`]
//! descriptor in a per-process supplemental page table. The first access
//! faults, and [`vm::Vm::try_handle_fault`] binds the page to a physical
//! frame, running the variant-specific population step: zero fill or swap
//! read for anonymous pages, a file read for memory-mapped pages. Frames
//! are reclaimed under memory pressure by FIFO eviction; anonymous victims
//! go to a slot on the swap device, file victims are written back to their
//! backing file when dirty.
//!
//! The surrounding kernel supplies its services through the
//! [`vm::Platform`] contract bundle: the hardware page table
//! ([`vm::AddressMapper`]), the user-pool page allocator, the swap disk
//! ([`anon::SectorDevice`]) and the file layer ([`file::MappedFile`]).
//! Host tests drive the whole core through mock implementations of those
//! contracts.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub use self::{
    addr::{PageRound, VirtAddr},
    anon::{SectorDevice, SwapDevice, SwapSlot},
    error::VmError,
    file::MappedFile,
    page::{FileSegment, Page, PageInit, PageState, PageType},
    vm::{AddressMapper, PageFault, Platform, Vm},
};

pub mod addr;
pub mod anon;
pub mod error;
pub mod file;
pub mod frame;
pub mod layout;
pub mod page;
pub mod spt;
pub mod vm;
