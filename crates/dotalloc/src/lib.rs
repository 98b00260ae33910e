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

//! Heap allocator over anonymous memory mappings
//!
//! This crate provides a mutex-guarded free-list allocator:
//! - Configurable placement strategies (first, best and worst fit)
//! - Block splitting on allocation and adjacency coalescing on free
//! - Heap growth through additional anonymous mappings
//! - Aligned allocation via an over-allocate + back-pointer scheme
//! - Page-protection changes for live allocations
//! - Usage statistics with a fragmentation ratio

pub mod allocator; // The heap manager itself
pub mod config; // Configuration and placement strategy selection
pub mod error; // Crate-wide error type
pub mod global; // Process-wide convenience instance
pub mod region; // OS mappings and page protection
pub mod stats; // Memory usage counters
pub mod util; // Shared helpers

mod block; // In-band headers and intrusive block lists

// Re-export main components for easier access
pub use allocator::{Allocator, BlockInfo};
pub use block::{ALLOC_ALIGNMENT, HEADER_SIZE};
pub use config::{AllocationStrategy, AllocatorConfig};
pub use error::AllocatorError;
pub use region::Protection;
pub use stats::AllocatorStats;
pub use util::{align_to, get_page_size, is_power_of_two};
