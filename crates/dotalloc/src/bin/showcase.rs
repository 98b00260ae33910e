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

//! Demonstration driver for the allocator
//!
//! Sets up a small best-fit heap, performs a handful of allocations and
//! prints the memory map before and after a free.

use dotalloc::{AllocationStrategy, Allocator, AllocatorConfig};
use env_logger::Env;
use log::info;
use std::process;

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = AllocatorConfig::default()
        .with_initial_heap_size(1024 * 1024)
        .with_strategy(AllocationStrategy::BestFit);

    let allocator = match Allocator::new(config) {
        Ok(allocator) => allocator,
        Err(err) => {
            eprintln!("Failed to initialize allocator: {err}");
            process::exit(1);
        }
    };

    let ptr1 = allocator.allocate(100).expect("allocation failed");
    let ptr2 = allocator.allocate(200).expect("allocation failed");
    let ptr3 = allocator.allocate(300).expect("allocation failed");

    allocator.print_memory_map();

    allocator.free(ptr2);

    println!("\nAfter freeing the 200-byte allocation:");
    allocator.print_memory_map();

    allocator.free(ptr1);
    allocator.free(ptr3);

    let stats = allocator.stats();
    info!(
        "showcase done: {} allocations total, {} bytes peak usage",
        stats.total_allocations, stats.peak_usage
    );
}
