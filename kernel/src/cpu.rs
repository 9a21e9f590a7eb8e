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

//! Logical CPU numbering.
//!
//! Every online core has a hardware APIC id (not necessarily small or contiguous) and a logical
//! index in `0..MAX_CPUS` used to size per-CPU arrays (temporary-mapping slots, IPM queues,
//! runqueues). This module is the single place that maps one to the other.

use crate::{arch::x86::apic, sync::IntSpin};

/// Upper bound on the number of cores this kernel can manage.
///
/// Bounds the size of every per-CPU array in the memory and scheduling core (temp-mapping
/// slots, IPM queues, runqueues). 32 is generous for the 32-bit targets this kernel boots on.
pub const MAX_CPUS: usize = 32;

/// APIC id of each registered logical CPU, `None` for unused slots.
static REGISTRY: IntSpin<[Option<u8>; MAX_CPUS]> = IntSpin::new([None; MAX_CPUS]);

/// Registers the calling CPU (identified by its local APIC id) and returns its logical index.
///
/// Called once per core during SMP bring-up. Panics if more than [`MAX_CPUS`] cores register.
pub fn register(apic_id: u8) -> usize {
	let mut reg = REGISTRY.lock();
	if let Some(i) = reg.iter().position(|e| *e == Some(apic_id)) {
		return i;
	}
	let slot = reg.iter().position(|e| e.is_none()).expect("too many CPUs online");
	reg[slot] = Some(apic_id);
	slot
}

/// Returns the logical index of the calling CPU.
///
/// # Panics
///
/// Panics if the calling CPU has not been registered yet via [`register`].
pub fn id() -> usize {
	let apic_id = apic::lapic_id();
	let reg = REGISTRY.lock();
	reg.iter()
		.position(|e| *e == Some(apic_id))
		.expect("current CPU is not registered")
}

/// Returns the number of CPUs registered so far.
pub fn count() -> usize {
	REGISTRY.lock().iter().filter(|e| e.is_some()).count()
}

/// Returns the local APIC id of the logical CPU `id`, or `None` if it is not registered.
pub fn apic_id_of(id: usize) -> Option<u8> {
	REGISTRY.lock().get(id).copied().flatten()
}

/// Returns the local APIC id of every registered CPU.
///
/// Used to hand the discovered topology to [`crate::arch::x86::smp::init`] for bring-up.
pub fn registered_apic_ids() -> ([u8; MAX_CPUS], usize) {
	let reg = REGISTRY.lock();
	let mut out = [0u8; MAX_CPUS];
	let mut n = 0;
	for e in reg.iter().flatten() {
		out[n] = *e;
		n += 1;
	}
	(out, n)
}

/// Returns the logical indexes of every registered CPU other than the caller.
///
/// The result is a fixed-size buffer rather than a heap-allocated collection: this is used by the
/// IPM bus while broadcasting, which must not depend on the heap allocator.
pub fn others() -> ([usize; MAX_CPUS], usize) {
	let me = id();
	let reg = REGISTRY.lock();
	let mut out = [0usize; MAX_CPUS];
	let mut n = 0;
	for (i, e) in reg.iter().enumerate() {
		if i != me && e.is_some() {
			out[n] = i;
			n += 1;
		}
	}
	(out, n)
}
