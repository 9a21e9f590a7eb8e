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

//! System-wide memory accounting, updated by the buddy allocator as pages change hands.

use crate::sync::IntSpin;

/// A snapshot of system memory usage, all fields in KiB.
#[derive(Clone, Copy, Debug, Default)]
pub struct MemInfo {
	/// Total amount of physical memory known to the kernel.
	pub mem_total: usize,
	/// Amount of physical memory not currently allocated.
	pub mem_free: usize,
}

/// The global memory usage counters.
pub static MEM_INFO: IntSpin<MemInfo> = IntSpin::new(MemInfo {
	mem_total: 0,
	mem_free: 0,
});
