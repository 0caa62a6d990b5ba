//! Per-page descriptors.
//!
//! A [`Page`] tracks one virtual page of a process. It starts in the
//! [`PageState::Uninit`] state, holding only the data needed to populate
//! the page on first touch, and transitions in place to its intended type
//! when the page is first claimed. The transition is one-shot; a page
//! never becomes uninitialized again.

use alloc::sync::Arc;

use crate::{addr::VirtAddr, anon::SwapSlot, frame::FrameId};

/// The backing type a page has, or will have once initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Zero-filled memory, swapped to the swap device under pressure.
    Anon,
    /// A window onto a file segment, written back to the file when dirty.
    File,
}

/// One page-sized window onto a reopened file handle.
///
/// Created when a mapping is established and consumed by the first-touch
/// load. `read_bytes` may be short on the final page of a mapping; the
/// tail of the page is zero. `total_len` is the byte length of the whole
/// mapping, recorded so that unmapping can find every sibling page from
/// the base address alone.
pub struct FileSegment<F> {
    pub(crate) file: Arc<F>,
    pub(crate) offset: u64,
    pub(crate) read_bytes: usize,
    pub(crate) total_len: usize,
}

impl<F> Clone for FileSegment<F> {
    fn clone(&self) -> Self {
        Self {
            file: Arc::clone(&self.file),
            offset: self.offset,
            read_bytes: self.read_bytes,
            total_len: self.total_len,
        }
    }
}

impl<F> FileSegment<F> {
    pub(crate) fn new(file: Arc<F>, offset: u64, read_bytes: usize, total_len: usize) -> Self {
        Self {
            file,
            offset,
            read_bytes,
            total_len,
        }
    }

    /// Byte length of the mapping this segment belongs to.
    pub fn mapping_len(&self) -> usize {
        self.total_len
    }
}

/// How to populate a page the first time it is claimed.
pub enum PageInit<F> {
    /// Leave the freshly allocated frame as is; frames arrive zero-filled.
    Zeroed,
    /// Read a file segment into the frame and zero the tail.
    ///
    /// Combined with [`PageType::Anon`] this gives lazily loaded
    /// executable segments: file contents on first touch, swap-backed
    /// afterwards. Combined with [`PageType::File`] it is an mmap page.
    FromFile(FileSegment<F>),
}

impl<F> Clone for PageInit<F> {
    fn clone(&self) -> Self {
        match self {
            Self::Zeroed => Self::Zeroed,
            Self::FromFile(segment) => Self::FromFile(segment.clone()),
        }
    }
}

/// The state of a page, one variant at a time.
pub enum PageState<F> {
    /// Not yet touched; carries its pending initializer.
    Uninit { ty: PageType, init: PageInit<F> },
    /// Anonymous memory. `slot` is the swap slot holding the contents
    /// while the page is not resident, if it was ever evicted.
    Anon { slot: Option<SwapSlot> },
    /// File-backed memory.
    File { segment: FileSegment<F> },
}

/// Descriptor for one virtual page of a process.
pub struct Page<F> {
    va: VirtAddr,
    writable: bool,
    state: PageState<F>,
    frame: Option<FrameId>,
}

impl<F> Page<F> {
    pub(crate) fn new_uninit(va: VirtAddr, writable: bool, ty: PageType, init: PageInit<F>) -> Self {
        Self {
            va,
            writable,
            state: PageState::Uninit { ty, init },
            frame: None,
        }
    }

    /// Page-aligned virtual address; the identity of this page within its
    /// process.
    pub fn va(&self) -> VirtAddr {
        self.va
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// The page's backing type, resolving a pending initializer to the
    /// type it will produce.
    pub fn ty(&self) -> PageType {
        match &self.state {
            PageState::Uninit { ty, .. } => *ty,
            PageState::Anon { .. } => PageType::Anon,
            PageState::File { .. } => PageType::File,
        }
    }

    pub fn state(&self) -> &PageState<F> {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut PageState<F> {
        &mut self.state
    }

    pub(crate) fn set_state(&mut self, state: PageState<F>) {
        self.state = state;
    }

    /// The frame currently bound to this page, if resident.
    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// The swap slot holding this page's contents, if any.
    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match &self.state {
            PageState::Anon { slot } => *slot,
            _ => None,
        }
    }

    pub(crate) fn bind_frame(&mut self, frame: FrameId) {
        debug_assert!(self.frame.is_none());
        self.frame = Some(frame);
    }

    pub(crate) fn unbind_frame(&mut self) {
        self.frame = None;
    }

    /// Length of the whole mapping this page belongs to, for file pages
    /// (initialized or still pending).
    pub(crate) fn mapping_len(&self) -> Option<usize> {
        match &self.state {
            PageState::File { segment }
            | PageState::Uninit {
                init: PageInit::FromFile(segment),
                ty: PageType::File,
            } => Some(segment.total_len),
            _ => None,
        }
    }
}
