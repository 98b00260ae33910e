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

use thiserror::Error;

/// Errors that can occur during allocator operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocatorError {
    #[error("allocator is not initialized")]
    NotInitialized,
    #[error("allocator is already initialized")]
    AlreadyInitialized,
    #[error("requested size must be non-zero")]
    InvalidSize,
    #[error("alignment must be a non-zero power of two")]
    InvalidAlignment,
    #[error("pointer was not produced by this allocator")]
    InvalidPointer,
    #[error("anonymous memory mapping failed")]
    MappingFailed,
    #[error("no free block satisfies the request and the heap could not grow")]
    OutOfMemory,
    #[error("changing page protection failed")]
    ProtectionFailed,
}
