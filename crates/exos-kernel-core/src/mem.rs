//! Physical frames and per-environment address spaces
//!
//! Frame storage is reference-counted separately from the mappings that
//! point at it: "who may write" is tracked per mapping, "who may free" per
//! frame. A frame returns to the free list exactly when its reference
//! count reaches zero.
//!
//! An [`AddressSpace`] holds only the mappings below [`USER_TOP`]; the
//! kernel region above the split is fixed at boot and identical across
//! every environment, so the model does not materialize it.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use exos_abi::{is_page_aligned, KernelError, PagePerm, PAGE_SIZE, USER_TOP};

/// Handle to one physical frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct FrameId(pub u32);

struct FrameSlot {
    live: bool,
    refs: u32,
    data: Box<[u8]>,
}

/// Fixed-capacity physical frame allocator with per-frame reference
/// counts and page contents.
pub struct FrameTable {
    slots: Vec<FrameSlot>,
    free: Vec<u32>,
    capacity: usize,
}

impl FrameTable {
    /// An allocator managing `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
        }
    }

    /// Allocate a frame with reference count zero, or `None` when the
    /// table is exhausted. When `zero_fill` is false a reused frame keeps
    /// whatever bytes its previous owner left behind.
    pub fn alloc(&mut self, zero_fill: bool) -> Option<FrameId> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.live = true;
            slot.refs = 0;
            if zero_fill {
                slot.data.fill(0);
            }
            return Some(FrameId(index));
        }
        if self.slots.len() < self.capacity {
            let index = self.slots.len() as u32;
            self.slots.push(FrameSlot {
                live: true,
                refs: 0,
                data: alloc::vec![0u8; PAGE_SIZE].into_boxed_slice(),
            });
            return Some(FrameId(index));
        }
        None
    }

    /// Current reference count of a frame.
    pub fn refs(&self, frame: FrameId) -> u32 {
        self.slots[frame.0 as usize].refs
    }

    /// Whether a frame is allocated.
    pub fn is_live(&self, frame: FrameId) -> bool {
        self.slots
            .get(frame.0 as usize)
            .map(|s| s.live)
            .unwrap_or(false)
    }

    /// Add one reference.
    pub fn incref(&mut self, frame: FrameId) {
        let slot = &mut self.slots[frame.0 as usize];
        debug_assert!(slot.live);
        slot.refs += 1;
    }

    /// Drop one reference; the frame is released to the free list exactly
    /// when the count reaches zero.
    pub fn decref(&mut self, frame: FrameId) {
        let slot = &mut self.slots[frame.0 as usize];
        debug_assert!(slot.live && slot.refs > 0);
        slot.refs -= 1;
        if slot.refs == 0 {
            slot.live = false;
            self.free.push(frame.0);
        }
    }

    /// Release a never-mapped frame (reference count still zero), e.g.
    /// when a mapping step after allocation fails.
    pub fn release_unmapped(&mut self, frame: FrameId) {
        let slot = &mut self.slots[frame.0 as usize];
        debug_assert!(slot.live && slot.refs == 0);
        slot.live = false;
        self.free.push(frame.0);
    }

    /// Page contents of a frame.
    pub fn data(&self, frame: FrameId) -> &[u8] {
        &self.slots[frame.0 as usize].data
    }

    /// Mutable page contents of a frame.
    pub fn data_mut(&mut self, frame: FrameId) -> &mut [u8] {
        &mut self.slots[frame.0 as usize].data
    }

    /// Live frames with their reference counts.
    pub fn iter_live(&self) -> impl Iterator<Item = (FrameId, u32)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.live)
            .map(|(i, s)| (FrameId(i as u32), s.refs))
    }
}

/// One page mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// The mapped frame.
    pub frame: FrameId,
    /// Permissions of this mapping.
    pub perm: PagePerm,
}

/// Mappings of one environment below the user/kernel split.
#[derive(Default)]
pub struct AddressSpace {
    pages: BTreeMap<usize, Mapping>,
}

impl AddressSpace {
    /// An empty space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `frame` at `va`, replacing any prior mapping there. The new
    /// reference is counted before the displaced one is dropped, so
    /// remapping the same frame at the same address is safe.
    ///
    /// The `NoMem` arm of the result is part of the mapping-primitive
    /// contract (the original can fail allocating intermediate page
    /// tables); this model cannot hit it.
    pub fn insert(
        &mut self,
        frames: &mut FrameTable,
        frame: FrameId,
        va: usize,
        perm: PagePerm,
    ) -> Result<(), KernelError> {
        debug_assert!(is_page_aligned(va) && va < USER_TOP);
        frames.incref(frame);
        if let Some(old) = self.pages.insert(va, Mapping { frame, perm }) {
            frames.decref(old.frame);
        }
        Ok(())
    }

    /// Remove the mapping at `va`; silently succeeds when absent.
    pub fn remove(&mut self, frames: &mut FrameTable, va: usize) {
        if let Some(old) = self.pages.remove(&va) {
            frames.decref(old.frame);
        }
    }

    /// Look up the mapping covering `va` (any offset within the page).
    pub fn lookup(&self, va: usize) -> Option<Mapping> {
        self.pages.get(&exos_abi::page_align_down(va)).copied()
    }

    /// Remove every mapping (environment teardown).
    pub fn clear(&mut self, frames: &mut FrameTable) {
        let pages = core::mem::take(&mut self.pages);
        for mapping in pages.into_values() {
            frames.decref(mapping.frame);
        }
    }

    /// All mappings, in address order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, Mapping)> + '_ {
        self.pages.iter().map(|(&va, &m)| (va, m))
    }

    /// Number of mappings.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether the space has no mappings.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Validate that `[va, va + len)` lies below the split and that every
    /// page is mapped present + user (+ writable when `write` is set).
    /// Must be called before any dereference of a user-supplied range;
    /// returns the first faulting address.
    pub fn user_mem_check(&self, va: usize, len: usize, write: bool) -> Result<(), usize> {
        if len == 0 {
            return Ok(());
        }
        let end = match va.checked_add(len) {
            Some(end) if end <= USER_TOP => end,
            _ => return Err(va.max(USER_TOP)),
        };
        let mut page = exos_abi::page_align_down(va);
        while page < end {
            let ok = match self.pages.get(&page) {
                Some(m) => m.perm.present && m.perm.user && (!write || m.perm.write),
                None => false,
            };
            if !ok {
                return Err(va.max(page));
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }

    /// Copy bytes out of the space into `buf`, validating first.
    pub fn copy_in(
        &self,
        frames: &FrameTable,
        va: usize,
        buf: &mut [u8],
    ) -> Result<(), usize> {
        self.user_mem_check(va, buf.len(), false)?;
        let mut off = 0;
        while off < buf.len() {
            let cur = va + off;
            let page = exos_abi::page_align_down(cur);
            let in_page = cur - page;
            let chunk = (PAGE_SIZE - in_page).min(buf.len() - off);
            let mapping = self.pages[&page];
            buf[off..off + chunk]
                .copy_from_slice(&frames.data(mapping.frame)[in_page..in_page + chunk]);
            off += chunk;
        }
        Ok(())
    }

    /// Copy bytes from `data` into the space, validating writability
    /// first; nothing is written on failure.
    pub fn copy_out(
        &self,
        frames: &mut FrameTable,
        va: usize,
        data: &[u8],
    ) -> Result<(), usize> {
        self.user_mem_check(va, data.len(), true)?;
        let mut off = 0;
        while off < data.len() {
            let cur = va + off;
            let page = exos_abi::page_align_down(cur);
            let in_page = cur - page;
            let chunk = (PAGE_SIZE - in_page).min(data.len() - off);
            let mapping = self.pages[&page];
            frames.data_mut(mapping.frame)[in_page..in_page + chunk]
                .copy_from_slice(&data[off..off + chunk]);
            off += chunk;
        }
        Ok(())
    }
}
