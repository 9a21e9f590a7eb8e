//! Physical page frame allocation.
//!
//! This is the public contract the rest of the memory core (the address-space manager, the
//! kernel heap) allocates physical memory through. It wraps the [`buddy`] allocator for ordinary
//! pages and keeps a small dedicated pool below the 1MiB mark for callers that need conventional
//! memory, such as the SMP trampoline a booting application processor executes in real mode.

use crate::{memory, memory::buddy, sync::IntSpin};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering::Relaxed};
use utils::errno::{AllocError, AllocResult};

/// Base physical address of the low-memory pool.
///
/// Conventional memory below this address is claimed by real-mode structures (the BIOS data
/// area, the bootloader stack); the range starting here is reserved for the kernel by the linker
/// script and never handed to the buddy allocator.
const LOW_MEM_BASE: usize = 0x20000;
/// Number of 4KiB pages held by the low-memory pool.
const LOW_MEM_PAGES: usize = 16;

/// Bitmap of free (`false`) / allocated (`true`) pages in the low-memory pool.
static LOW_MEM_USED: IntSpin<[bool; LOW_MEM_PAGES]> = IntSpin::new([false; LOW_MEM_PAGES]);

/// When set, the next allocation (of either kind) fails with [`AllocError`] regardless of actual
/// memory pressure, and the flag resets itself. Used by tests to exercise OOM recovery paths.
static SIMULATE_OOM: AtomicBool = AtomicBool::new(false);
/// Number of frames currently handed out through this module, low-memory pool included.
static FRAMES_ALLOCATED: AtomicUsize = AtomicUsize::new(0);

/// Arms or disarms fault injection: the next call to [`alloc_frame`] or [`alloc_frame_low_mem`]
/// fails as though memory were exhausted, then the mechanism disarms itself.
pub fn set_oom_simulation(enabled: bool) {
	SIMULATE_OOM.store(enabled, Relaxed);
}

/// Consumes the fault-injection flag, returning whether this allocation should be failed.
fn take_simulated_oom() -> bool {
	SIMULATE_OOM.swap(false, Relaxed)
}

/// Allocates a single page frame of physical memory from the kernel zone.
///
/// Returns the *physical* address of the frame.
pub fn alloc_frame() -> AllocResult<memory::PhysAddr> {
	if take_simulated_oom() {
		return Err(AllocError);
	}
	let ptr = buddy::alloc(0, buddy::FLAG_ZONE_TYPE_KERNEL)?;
	FRAMES_ALLOCATED.fetch_add(1, Relaxed);
	Ok(memory::PhysAddr(ptr.as_ptr() as usize))
}

/// Allocates a single page frame located entirely below the 1MiB mark.
///
/// This is meant for data structures real-mode code must access directly, such as the startup
/// trampoline of an application processor coming out of reset.
pub fn alloc_frame_low_mem() -> AllocResult<memory::PhysAddr> {
	if take_simulated_oom() {
		return Err(AllocError);
	}
	let mut used = LOW_MEM_USED.lock();
	let slot = used.iter().position(|u| !u).ok_or(AllocError)?;
	used[slot] = true;
	FRAMES_ALLOCATED.fetch_add(1, Relaxed);
	Ok(memory::PhysAddr(LOW_MEM_BASE + slot * memory::PAGE_SIZE))
}

/// Frees a frame previously returned by [`alloc_frame`] or [`alloc_frame_low_mem`].
///
/// # Safety
///
/// The frame must not still be mapped or otherwise in use, and must have been obtained from this
/// module.
pub unsafe fn free_frame(addr: memory::PhysAddr) {
	if (LOW_MEM_BASE..LOW_MEM_BASE + LOW_MEM_PAGES * memory::PAGE_SIZE).contains(&addr.0) {
		let slot = (addr.0 - LOW_MEM_BASE) / memory::PAGE_SIZE;
		let mut used = LOW_MEM_USED.lock();
		debug_assert!(used[slot], "double free of a low-memory frame");
		used[slot] = false;
	} else {
		buddy::free(addr.0 as _, 0);
	}
	FRAMES_ALLOCATED.fetch_sub(1, Relaxed);
}

/// Returns the number of frames currently allocated through this module.
pub fn frames_allocated() -> usize {
	FRAMES_ALLOCATED.load(Relaxed)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test_case]
	fn frame_alloc_free() {
		let before = frames_allocated();
		let f = alloc_frame().unwrap();
		assert_eq!(frames_allocated(), before + 1);
		unsafe {
			free_frame(f);
		}
		assert_eq!(frames_allocated(), before);
	}

	#[test_case]
	fn frame_low_mem_bounds() {
		let f = alloc_frame_low_mem().unwrap();
		assert!(f.0 < 0x100000);
		unsafe {
			free_frame(f);
		}
	}

	#[test_case]
	fn frame_oom_simulation() {
		set_oom_simulation(true);
		assert!(alloc_frame().is_err());
		// The flag disarms itself after one failed allocation.
		assert!(alloc_frame().is_ok());
	}
}
