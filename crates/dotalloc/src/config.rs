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

use serde::{Deserialize, Serialize};

/// Strategy for selecting a free block during allocation
/// Controls how the free list is searched for an eligible block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocationStrategy {
    /// Use the first block that is large enough
    #[default]
    FirstFit,
    /// Use the block with the smallest surplus over the request
    BestFit,
    /// Use the block with the largest surplus over the request
    WorstFit,
}

impl AllocationStrategy {
    /// Decodes the raw integer selector used by external configuration.
    /// Unknown values fall back to first fit.
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            1 => AllocationStrategy::BestFit,
            2 => AllocationStrategy::WorstFit,
            _ => AllocationStrategy::FirstFit,
        }
    }
}

/// Configuration parameters for an allocator instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Size of the initial heap mapping in bytes, rounded up to the page size
    pub initial_heap_size: usize,
    /// Page size override; 0 selects the platform page size
    pub page_size: usize,
    /// Reserved for overflow detection; no behavior is attached to it yet
    pub use_guard_pages: bool,
    /// How the placement engine searches the free list
    pub allocation_strategy: AllocationStrategy,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            initial_heap_size: 1024 * 1024,
            page_size: 0,
            use_guard_pages: false,
            allocation_strategy: AllocationStrategy::FirstFit,
        }
    }
}

impl AllocatorConfig {
    /// Sets the initial heap size in bytes
    pub fn with_initial_heap_size(mut self, size: usize) -> Self {
        self.initial_heap_size = size;
        self
    }

    /// Overrides the page size; pass 0 to use the platform page size
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the placement strategy
    pub fn with_strategy(mut self, strategy: AllocationStrategy) -> Self {
        self.allocation_strategy = strategy;
        self
    }

    /// Reserves guard pages around allocations (currently unused)
    pub fn with_guard_pages(mut self, enabled: bool) -> Self {
        self.use_guard_pages = enabled;
        self
    }
}
