/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Allocation-failure error type.
//!
//! Everything under the core's allocation paths (frames, page tables, heap nodes, IPM payloads)
//! reports exhaustion through [`AllocResult`] instead of aborting. Callers decide whether running
//! out of memory is fatal (at boot) or recoverable (once the system is live).

pub use core::alloc::AllocError;

/// Result of an operation that may fail because of memory exhaustion.
pub type AllocResult<T> = Result<T, AllocError>;
