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

/// Snapshot of the allocator's memory counters
/// Counters are only mutated under the allocator guard, so a snapshot is
/// always consistent with the block state it was taken against
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllocatorStats {
    pub total_memory: usize,        // Sum of all mapped bytes
    pub used_memory: usize,         // Bytes spanned by blocks on the used list
    pub free_memory: usize,         // Bytes spanned by blocks on the free list
    pub overhead: usize,            // Per-block header size
    pub peak_usage: usize,          // High-water mark of used_memory
    pub total_allocations: u64,     // Successful allocations since init
    pub active_allocations: u64,    // Allocations not yet freed
    pub fragmentation_ratio: f64,   // 1 - largest_free_block / free_memory
}

impl AllocatorStats {
    /// Accounts for a block moving to the used list
    pub(crate) fn record_allocation(&mut self, block_size: usize) {
        self.used_memory += block_size;
        self.free_memory = self.free_memory.saturating_sub(block_size);
        self.total_allocations += 1;
        self.active_allocations += 1;

        if self.used_memory > self.peak_usage {
            self.peak_usage = self.used_memory;
        }
    }

    /// Accounts for a block moving back to the free list
    pub(crate) fn record_free(&mut self, block_size: usize) {
        self.used_memory = self.used_memory.saturating_sub(block_size);
        self.free_memory += block_size;
        self.active_allocations = self.active_allocations.saturating_sub(1);
    }

    /// Accounts for a fresh mapping joining the heap
    pub(crate) fn record_extension(&mut self, mapped_bytes: usize) {
        self.total_memory += mapped_bytes;
        self.free_memory += mapped_bytes;
    }

    /// Accounts for a used block growing in place by absorbing free bytes
    pub(crate) fn record_inplace_growth(&mut self, delta: usize) {
        self.used_memory += delta;
        self.free_memory = self.free_memory.saturating_sub(delta);

        if self.used_memory > self.peak_usage {
            self.peak_usage = self.used_memory;
        }
    }

    /// Accounts for a used block releasing its tail back to the free list
    pub(crate) fn record_inplace_shrink(&mut self, delta: usize) {
        self.used_memory = self.used_memory.saturating_sub(delta);
        self.free_memory += delta;
    }

    /// Recomputes the fragmentation ratio from the largest free block;
    /// a single contiguous free region yields 0.0
    pub(crate) fn update_fragmentation(&mut self, largest_free_block: usize) {
        if self.free_memory == 0 {
            self.fragmentation_ratio = 0.0;
        } else {
            self.fragmentation_ratio = 1.0 - (largest_free_block as f64 / self.free_memory as f64);
        }
    }
}
