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

//! Synchronization primitives used across the kernel.
//!
//! [`spin`] provides the spinlocks every shared structure in the memory and scheduling core is
//! built on, [`once`] provides one-shot boot-time initialization of globals, and [`atomic`] fills
//! in the atomics this target doesn't support natively.

pub mod atomic;
pub mod once;
pub mod spin;

pub use once::OnceInit;
pub use spin::{IntSpin, IntSpinGuard, Spin, SpinGuard};
