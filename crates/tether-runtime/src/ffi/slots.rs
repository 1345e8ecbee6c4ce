//! Trampoline slot allocator
//!
//! Carves fixed-size slots out of read-write-execute pages and hands them
//! out from a free stack. Pages are mapped one at a time when the stack runs
//! dry and are only unmapped when the allocator itself is dropped.
//!
//! The allocator does no locking; the trampoline registry owns it behind
//! its lock.

use crate::ffi::error::{FfiError, FfiResult};
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Bytes per trampoline slot; large enough for the biggest stub on any
/// supported target
pub const TRAMPOLINE_SLOT_SIZE: usize = 64;

/// A mapped block of executable memory
pub trait ExecutableRegion: Send {
    fn base(&self) -> NonNull<u8>;
    fn len(&self) -> usize;
}

/// Platform source of executable pages
pub trait PageMapper: Send {
    /// Map one fresh page
    fn map_page(&mut self) -> FfiResult<Box<dyn ExecutableRegion>>;
}

/// Slot identity: page number plus slot index within the page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId {
    page: u32,
    index: u32,
}

/// Writable view of one slot, handed to stub initializers
pub struct SlotMemory<'a> {
    bytes: &'a mut [u8],
}

impl SlotMemory<'_> {
    /// Address generated code will be entered at
    pub fn address(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Free-stack allocator over mapped pages
pub struct SlotAllocator {
    mapper: Box<dyn PageMapper>,
    pages: Vec<Box<dyn ExecutableRegion>>,
    free: Vec<SlotId>,
    total_slots: usize,
}

impl SlotAllocator {
    pub fn new(mapper: Box<dyn PageMapper>) -> Self {
        Self {
            mapper,
            pages: Vec::new(),
            free: Vec::new(),
            total_slots: 0,
        }
    }

    /// Pop a free slot, mapping a new page if none is left
    pub fn allocate(&mut self) -> FfiResult<SlotId> {
        if self.free.is_empty() {
            self.grow()?;
        }
        self.free.pop().ok_or(FfiError::OutOfMemory {
            requested: TRAMPOLINE_SLOT_SIZE,
        })
    }

    /// Return a slot to the free stack. The memory is left as is.
    pub fn release(&mut self, slot: SlotId) {
        debug_assert!(!self.free.contains(&slot), "slot released twice");
        self.free.push(slot);
    }

    /// Map `count` pages ahead of demand
    pub fn reserve_pages(&mut self, count: usize) -> FfiResult<()> {
        for _ in 0..count {
            self.grow()?;
        }
        Ok(())
    }

    pub fn slot_address(&self, slot: SlotId) -> *const u8 {
        let base = self.pages[slot.page as usize].base().as_ptr();
        base.wrapping_add(slot.index as usize * TRAMPOLINE_SLOT_SIZE)
    }

    /// Writable view of a slot; `None` if `slot` lies outside this
    /// allocator's pages
    pub fn slot_memory(&mut self, slot: SlotId) -> Option<SlotMemory<'_>> {
        let region = self.pages.get(slot.page as usize)?;
        let offset = slot.index as usize * TRAMPOLINE_SLOT_SIZE;
        if offset + TRAMPOLINE_SLOT_SIZE > region.len() {
            return None;
        }
        // Safety: the slot lies inside a live mapping owned by `self`, and the
        // `&mut self` borrow keeps any other view of it from existing.
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(region.base().as_ptr().add(offset), TRAMPOLINE_SLOT_SIZE)
        };
        Some(SlotMemory { bytes })
    }

    pub fn pages_mapped(&self) -> usize {
        self.pages.len()
    }

    pub fn free_slots(&self) -> usize {
        self.free.len()
    }

    pub fn slots_in_use(&self) -> usize {
        self.total_slots - self.free.len()
    }

    fn grow(&mut self) -> FfiResult<()> {
        let region = self.mapper.map_page()?;
        let count = region.len() / TRAMPOLINE_SLOT_SIZE;
        if count == 0 {
            return Err(FfiError::OutOfMemory {
                requested: TRAMPOLINE_SLOT_SIZE,
            });
        }

        let page = self.pages.len() as u32;
        self.pages.push(region);
        // Reverse order so the lowest address is handed out first
        self.free
            .extend((0..count as u32).rev().map(|index| SlotId { page, index }));
        self.total_slots += count;
        debug!(target: "tether::ffi", page, slots = count, "mapped trampoline page");
        Ok(())
    }
}

/// Anonymous read-write-execute pages from the operating system
pub struct SystemPages {
    page_size: usize,
}

impl SystemPages {
    pub fn new() -> Self {
        Self {
            page_size: platform::page_size().max(TRAMPOLINE_SLOT_SIZE),
        }
    }
}

impl Default for SystemPages {
    fn default() -> Self {
        Self::new()
    }
}

impl PageMapper for SystemPages {
    fn map_page(&mut self) -> FfiResult<Box<dyn ExecutableRegion>> {
        match platform::map_rwx(self.page_size) {
            Some(base) => Ok(Box::new(OsPage {
                base,
                len: self.page_size,
            })),
            None => {
                warn!(
                    target: "tether::ffi",
                    error = %std::io::Error::last_os_error(),
                    "executable page mapping failed"
                );
                Err(FfiError::OutOfMemory {
                    requested: self.page_size,
                })
            }
        }
    }
}

struct OsPage {
    base: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is plain memory owned by this value
unsafe impl Send for OsPage {}

impl ExecutableRegion for OsPage {
    fn base(&self) -> NonNull<u8> {
        self.base
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for OsPage {
    fn drop(&mut self) {
        // Safety: `base`/`len` came from a successful map_rwx call
        unsafe { platform::unmap(self.base, self.len) };
    }
}

#[cfg(unix)]
mod platform {
    use std::ptr::{self, NonNull};

    pub fn page_size() -> usize {
        // Safety: sysconf has no preconditions
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as usize
        } else {
            4096
        }
    }

    pub fn map_rwx(len: usize) -> Option<NonNull<u8>> {
        // Safety: anonymous private mapping, no existing memory is touched
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            None
        } else {
            NonNull::new(ptr as *mut u8)
        }
    }

    /// # Safety
    /// `base`/`len` must describe a live mapping from [`map_rwx`]
    pub unsafe fn unmap(base: NonNull<u8>, len: usize) {
        unsafe {
            libc::munmap(base.as_ptr() as *mut libc::c_void, len);
        }
    }
}

#[cfg(windows)]
mod platform {
    use std::ptr::{self, NonNull};
    use windows_sys::Win32::System::Memory::{
        VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
    };
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    pub fn page_size() -> usize {
        // Safety: GetSystemInfo only writes the provided struct
        let info = unsafe {
            let mut info: SYSTEM_INFO = std::mem::zeroed();
            GetSystemInfo(&mut info);
            info
        };
        if info.dwPageSize > 0 {
            info.dwPageSize as usize
        } else {
            4096
        }
    }

    pub fn map_rwx(len: usize) -> Option<NonNull<u8>> {
        // Safety: fresh reservation, no existing memory is touched
        let ptr = unsafe {
            VirtualAlloc(
                ptr::null(),
                len,
                MEM_RESERVE | MEM_COMMIT,
                PAGE_EXECUTE_READWRITE,
            )
        };
        NonNull::new(ptr as *mut u8)
    }

    /// # Safety
    /// `base` must be a live allocation from [`map_rwx`]
    pub unsafe fn unmap(base: NonNull<u8>, _len: usize) {
        unsafe {
            VirtualFree(base.as_ptr() as *mut _, 0, MEM_RELEASE);
        }
    }
}
