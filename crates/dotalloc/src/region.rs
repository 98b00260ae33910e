// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use std::{fmt, ptr::NonNull};

use bitflags::bitflags;
use log::warn;

use crate::{error::AllocatorError, util::align_to};

bitflags! {
    /// Access rights of the pages backing a block
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXEC = 0b100;
    }
}

impl Protection {
    /// Converts the flags into the operating system's protection vocabulary
    pub(crate) fn to_native(self) -> i32 {
        let mut prot = libc::PROT_NONE;
        if self.contains(Protection::READ) {
            prot |= libc::PROT_READ;
        }
        if self.contains(Protection::WRITE) {
            prot |= libc::PROT_WRITE;
        }
        if self.contains(Protection::EXEC) {
            prot |= libc::PROT_EXEC;
        }
        prot
    }
}

impl fmt::Display for Protection {
    /// Renders the flags in the conventional `rwx` form
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.contains(Protection::READ) { 'r' } else { '-' },
            if self.contains(Protection::WRITE) { 'w' } else { '-' },
            if self.contains(Protection::EXEC) { 'x' } else { '-' },
        )
    }
}

/// One anonymous mapping acquired from the operating system
/// Blocks never straddle extents; the extent owns its pages and
/// returns them on drop
#[derive(Debug)]
pub(crate) struct HeapExtent {
    ptr: NonNull<u8>, // Base of the mapping
    len: usize,       // Length in bytes, always a page-size multiple
}

// The extent is only ever mutated under the allocator guard
unsafe impl Send for HeapExtent {}

impl HeapExtent {
    /// Maps `size` bytes (rounded up to the page size) of private,
    /// anonymous, readable and writable memory
    ///
    /// # Arguments
    /// * `size` - Minimum number of bytes required
    /// * `page_size` - Page size the mapping is rounded to
    ///
    /// # Returns
    /// * `Result<Self, AllocatorError>` - The extent or `MappingFailed`
    pub fn map_anonymous(size: usize, page_size: usize) -> Result<Self, AllocatorError> {
        let aligned_len = align_to(size.max(1), page_size);

        unsafe {
            let ptr = libc::mmap(
                std::ptr::null_mut(),
                aligned_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            );

            if ptr == libc::MAP_FAILED {
                return Err(AllocatorError::MappingFailed);
            }

            Ok(Self {
                ptr: NonNull::new_unchecked(ptr as *mut u8),
                len: aligned_len,
            })
        }
    }

    /// Base address of the mapping
    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    /// Length of the mapping in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    /// Pointer to the first byte of the mapping
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Whether `addr` falls inside this mapping
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.len
    }
}

impl Drop for HeapExtent {
    fn drop(&mut self) {
        unsafe {
            let result = libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);

            if result != 0 {
                warn!("failed to unmap extent at {:p} ({} bytes)", self.ptr.as_ptr(), self.len);
            }
        }
    }
}

/// Changes the protection of every page covering `[addr, addr + size)`
///
/// The base is rounded down to a page boundary and the length rounded up,
/// so the change can spill onto pages shared with neighboring blocks.
///
/// # Arguments
/// * `addr` - First byte of the span to protect
/// * `size` - Length of the span in bytes
/// * `protection` - New access rights
/// * `page_size` - Page size used for the rounding
///
/// # Returns
/// * `Result<(), AllocatorError>` - `ProtectionFailed` if the OS rejects the change
pub(crate) fn protect_range(addr: usize, size: usize, protection: Protection, page_size: usize) -> Result<(), AllocatorError> {
    let page_base = addr & !(page_size - 1);
    let span = align_to(size + (addr - page_base), page_size);

    unsafe {
        let result = libc::mprotect(page_base as *mut libc::c_void, span, protection.to_native());

        if result != 0 {
            return Err(AllocatorError::ProtectionFailed);
        }
    }

    Ok(())
}
