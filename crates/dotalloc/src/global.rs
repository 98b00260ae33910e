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

//! Process-wide convenience instance
//!
//! A single [`Allocator`] value behind a mutex, with free functions
//! mirroring the C-style surface: operations before [`init`] (or after
//! [`cleanup`]) return empty values instead of panicking, `stats`
//! returns a zeroed snapshot, and `protect` collapses to a boolean.
//! Code that can own its allocator should prefer the explicit
//! [`Allocator`] value.

use std::{ptr::NonNull, sync::Mutex};

use crate::{
    allocator::Allocator,
    config::AllocatorConfig,
    error::AllocatorError,
    region::Protection,
    stats::AllocatorStats,
};

static INSTANCE: Mutex<Option<Allocator>> = Mutex::new(None);

/// Initializes the process-wide allocator
///
/// # Errors
/// * `AlreadyInitialized` - a prior `init` has not been undone by [`cleanup`]
/// * any error of [`Allocator::new`]
pub fn init(config: AllocatorConfig) -> Result<(), AllocatorError> {
    let mut slot = INSTANCE.lock().unwrap();
    if slot.is_some() {
        return Err(AllocatorError::AlreadyInitialized);
    }
    *slot = Some(Allocator::new(config)?);
    Ok(())
}

/// Tears down the process-wide allocator, returning every mapping to the
/// OS. Calling it again (or without a prior [`init`]) is a no-op.
pub fn cleanup() {
    let mut slot = INSTANCE.lock().unwrap();
    *slot = None;
}

/// Allocates `size` bytes; `None` before init or on failure
pub fn alloc(size: usize) -> Option<NonNull<u8>> {
    let slot = INSTANCE.lock().unwrap();
    slot.as_ref()?.allocate(size).ok()
}

/// Allocates `size` bytes aligned to `align`; `None` before init, on an
/// invalid alignment or on failure
pub fn alloc_aligned(size: usize, align: usize) -> Option<NonNull<u8>> {
    let slot = INSTANCE.lock().unwrap();
    slot.as_ref()?.allocate_aligned(size, align).ok()
}

/// Frees a pointer from [`alloc`]; unknown pointers and calls before
/// init are silently ignored
pub fn free(ptr: NonNull<u8>) {
    let slot = INSTANCE.lock().unwrap();
    if let Some(allocator) = slot.as_ref() {
        allocator.free(ptr);
    }
}

/// Frees a pointer from [`alloc_aligned`]
///
/// # Safety
/// `ptr` must come from [`alloc_aligned`] and not have been freed since.
pub unsafe fn free_aligned(ptr: NonNull<u8>) {
    let slot = INSTANCE.lock().unwrap();
    if let Some(allocator) = slot.as_ref() {
        unsafe { allocator.free_aligned(ptr) };
    }
}

/// Resizes an allocation; `None` pointer allocates, zero size frees.
/// Returns `None` before init, after a free-by-zero or on failure (the
/// old block is preserved on failure).
pub fn realloc(ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
    let slot = INSTANCE.lock().unwrap();
    slot.as_ref()?.reallocate(ptr, size).ok().flatten()
}

/// Changes page protection over `[ptr, ptr + size)`; `false` before
/// init, for unknown pointers or when the OS rejects the change
pub fn protect(ptr: NonNull<u8>, size: usize, protection: Protection) -> bool {
    let slot = INSTANCE.lock().unwrap();
    match slot.as_ref() {
        Some(allocator) => allocator.protect(ptr, size, protection).is_ok(),
        None => false,
    }
}

/// Snapshot of the memory counters; zeroed before init
pub fn stats() -> AllocatorStats {
    let slot = INSTANCE.lock().unwrap();
    slot.as_ref().map(Allocator::stats).unwrap_or_default()
}

/// Prints the memory map of the process-wide allocator, if initialized
pub fn print_memory_map() {
    let slot = INSTANCE.lock().unwrap();
    if let Some(allocator) = slot.as_ref() {
        allocator.print_memory_map();
    }
}
