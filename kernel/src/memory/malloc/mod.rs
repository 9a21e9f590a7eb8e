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

//! The kernel heap allocator.
//!
//! Free chunks of every group are kept on a single list sorted by address; an allocation scans it
//! front to back and takes the first chunk that fits (first-fit), splitting off the remainder only
//! when it's big enough to ever be reused again. A chunk is coalesced with its free neighbours the
//! instant it's freed, so fragmentation never has a chance to accumulate silently.
//!
//! When no free chunk is big enough, a new group is mapped through [`vmem`](crate::memory::vmem):
//! the allocator's lock is released for the duration of that call, since mapping a group's pages
//! can reach into the IPM bus for a TLB shootdown, and the lock ordering for this kernel requires
//! the heap lock never be held across that boundary.

mod chunk;
mod group;

use crate::{memory, sync::IntSpin};
use chunk::Chunk;
use core::{
	alloc::Layout,
	cmp::Ordering,
	intrinsics::unlikely,
	num::NonZeroUsize,
	ptr,
	ptr::NonNull,
	sync::atomic::{AtomicUsize, Ordering::Relaxed},
};
use group::Group;
use utils::errno::AllocResult;

/// Serializes every access to the chunk lists across every group.
static MUTEX: IntSpin<()> = IntSpin::new(());
/// Number of bytes currently handed out to callers.
static TOTAL_ALLOCATED: AtomicUsize = AtomicUsize::new(0);

/// Returns the number of bytes currently allocated through this allocator.
pub fn kmalloc_total_allocated() -> usize {
	TOTAL_ALLOCATED.load(Relaxed)
}

unsafe fn alloc(n: NonZeroUsize) -> AllocResult<NonNull<u8>> {
	loop {
		{
			let _guard = MUTEX.lock();
			if let Some(free_chunk) = chunk::get_available_chunk(n) {
				free_chunk.chunk.split(n.get());
				#[cfg(config_debug_malloc_check)]
				free_chunk.check();
				let chunk = &mut free_chunk.chunk;
				chunk.used = true;
				let ptr = chunk.ptr();
				debug_assert!(ptr.is_aligned_to(chunk::ALIGNMENT));
				debug_assert!(ptr.as_ptr() as usize >= memory::PROCESS_END.0);
				TOTAL_ALLOCATED.fetch_add(chunk.get_size(), Relaxed);
				// Allocations are zeroed: the chunk may still hold whatever a previous occupant (or
				// the free list links written by `free`) last left there.
				ptr::write_bytes(ptr.as_ptr(), 0, n.get());
				return Ok(ptr);
			}
		}
		// No free chunk is large enough: grow the heap with a new group. The lock is released
		// across this call (see module documentation).
		let group = Group::new(n)?;
		let _guard = MUTEX.lock();
		group.first_chunk.as_free_chunk().unwrap().free_list_insert();
	}
}

unsafe fn realloc(ptr: NonNull<u8>, n: NonZeroUsize) -> AllocResult<NonNull<u8>> {
	let old_size = {
		let _guard = MUTEX.lock();
		let chunk = Chunk::from_ptr(ptr.as_ptr());
		assert!(chunk.used);
		#[cfg(config_debug_malloc_check)]
		chunk.check();
		let old_size = chunk.get_size();
		match n.get().cmp(&old_size) {
			Ordering::Less => {
				chunk.shrink(old_size - n.get());
				TOTAL_ALLOCATED.fetch_sub(old_size - n.get(), Relaxed);
				return Ok(ptr);
			}
			Ordering::Greater => {
				if chunk.grow(n.get() - old_size) {
					TOTAL_ALLOCATED.fetch_add(n.get() - old_size, Relaxed);
					return Ok(ptr);
				}
			}
			Ordering::Equal => return Ok(ptr),
		}
		old_size
	};
	// In-place growth didn't fit: relocate. The lock was released above, since `alloc`/`free`
	// below each take it again on their own.
	let mut new_ptr = alloc(n)?;
	ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_mut(), old_size);
	free(ptr);
	Ok(new_ptr)
}

unsafe fn free(mut ptr: NonNull<u8>) {
	let _guard = MUTEX.lock();
	// Get chunk
	let chunk = Chunk::from_ptr(ptr.as_mut());
	assert!(chunk.used);
	#[cfg(config_debug_malloc_check)]
	chunk.check();
	// Mark as free. The bytes where the free-list links live still hold whatever the caller's
	// allocation last wrote there, so they must be cleared before anything walks them.
	chunk.used = false;
	TOTAL_ALLOCATED.fetch_sub(chunk.get_size(), Relaxed);
	let free_chunk = chunk.as_free_chunk().unwrap();
	free_chunk.reset_links();
	// Merge with adjacent chunks
	let chunk = chunk.coalesce();
	// If this is the last chunk in the group, drop the group entirely; otherwise the merged
	// chunk is free and not yet on the list.
	if chunk.is_single() {
		let group: *mut Group = Group::from_first_chunk(chunk as *mut Chunk);
		ptr::drop_in_place(group);
	} else {
		chunk.as_free_chunk().unwrap().free_list_insert();
	}
}

/// Allocates `layout.size()` bytes of kernelspace memory.
///
/// On success, the allocation is suitably aligned for any type with an alignment requirement no
/// larger than [`chunk::ALIGNMENT`].
pub fn kmalloc(layout: Layout) -> AllocResult<NonNull<[u8]>> {
	let Some(size) = NonZeroUsize::new(layout.size()) else {
		return Ok(NonNull::slice_from_raw_parts(layout.dangling(), 0));
	};
	let ptr = unsafe { alloc(size)? };
	Ok(NonNull::slice_from_raw_parts(ptr, size.get()))
}

/// Frees a pointer previously returned by [`kmalloc`].
pub fn kfree(ptr: NonNull<u8>, layout: Layout) {
	if unlikely(layout.size() == 0) {
		return;
	}
	unsafe {
		free(ptr);
	}
}

#[no_mangle]
unsafe fn __alloc(layout: Layout) -> AllocResult<NonNull<[u8]>> {
	kmalloc(layout)
}

#[no_mangle]
unsafe fn __realloc(
	ptr: NonNull<u8>,
	old_layout: Layout,
	new_layout: Layout,
) -> AllocResult<NonNull<[u8]>> {
	let Some(new_size) = NonZeroUsize::new(new_layout.size()) else {
		kfree(ptr, old_layout);
		return Ok(NonNull::slice_from_raw_parts(new_layout.dangling(), 0));
	};
	let ptr = realloc(ptr, new_size)?;
	Ok(NonNull::slice_from_raw_parts(ptr, new_size.get()))
}

#[no_mangle]
unsafe fn __dealloc(ptr: NonNull<u8>, layout: Layout) {
	kfree(ptr, layout);
}

/// Adapter exposing this allocator as the crate's [`GlobalAlloc`](core::alloc::GlobalAlloc), so
/// that `alloc`'s `Box`, intrusive collections and the like go through [`kmalloc`]/[`kfree`].
pub struct KernelAlloc;

unsafe impl core::alloc::GlobalAlloc for KernelAlloc {
	unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
		kmalloc(layout)
			.map(|p| p.as_mut_ptr())
			.unwrap_or(ptr::null_mut())
	}

	unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
		let Some(ptr) = NonNull::new(ptr) else {
			return;
		};
		kfree(ptr, layout);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::memory::buddy;
	use core::slice;

	#[test_case]
	fn alloc_free_small() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let ptr = alloc(NonZeroUsize::new(1).unwrap()).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), 1).fill(!0);
			free(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn alloc_free_medium() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let ptr = alloc(NonZeroUsize::new(8).unwrap()).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), 8).fill(!0);
			free(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn alloc_free_page() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let ptr = alloc(NonZeroUsize::new(memory::PAGE_SIZE).unwrap()).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), memory::PAGE_SIZE).fill(!0);
			free(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn alloc_free_many_pages() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let ptr = alloc(NonZeroUsize::new(memory::PAGE_SIZE * 10).unwrap()).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), memory::PAGE_SIZE * 10).fill(!0);
			free(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn alloc_free_fifo() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let mut ptrs: [NonNull<u8>; 1024] = [NonNull::dangling(); 1024];
			for (i, p) in ptrs.iter_mut().enumerate() {
				let size = i + 1;
				let ptr = alloc(NonZeroUsize::new(size).unwrap()).unwrap();
				slice::from_raw_parts_mut(ptr.as_ptr(), size).fill(!0);
				*p = ptr;
			}
			for i in 0..ptrs.len() {
				for j in (i + 1)..ptrs.len() {
					assert_ne!(ptrs[j], ptrs[i]);
				}
			}
			for p in ptrs {
				free(p);
			}
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	fn lifo_test(i: usize) {
		unsafe {
			let ptr = alloc(NonZeroUsize::new(i).unwrap()).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), i).fill(!0);
			if i > 1 {
				lifo_test(i - 1);
			}
			free(ptr);
		}
	}

	#[test_case]
	fn alloc_free_lifo() {
		let usage = buddy::allocated_pages_count();
		lifo_test(100);
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	// TODO Check the integrity of the data after reallocation
	#[test_case]
	fn realloc_grow_byte_by_byte() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let mut ptr = alloc(NonZeroUsize::new(1).unwrap()).unwrap();
			for i in 1..memory::PAGE_SIZE {
				ptr = realloc(ptr, NonZeroUsize::new(i).unwrap()).unwrap();
				slice::from_raw_parts_mut(ptr.as_ptr(), i).fill(!0);
			}
			free(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	// TODO Check the integrity of the data after reallocation
	#[test_case]
	fn realloc_shrink_byte_by_byte() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let mut ptr = alloc(NonZeroUsize::new(memory::PAGE_SIZE).unwrap()).unwrap();
			for i in (1..memory::PAGE_SIZE).rev() {
				ptr = realloc(ptr, NonZeroUsize::new(i).unwrap()).unwrap();
				slice::from_raw_parts_mut(ptr.as_ptr(), i).fill(!0);
			}
			free(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn realloc_interleaved() {
		let usage = buddy::allocated_pages_count();
		unsafe {
			let mut ptr0 = alloc(NonZeroUsize::new(8).unwrap()).unwrap();
			slice::from_raw_parts_mut(ptr0.as_ptr(), 8).fill(!0);
			let mut ptr1 = alloc(NonZeroUsize::new(8).unwrap()).unwrap();
			slice::from_raw_parts_mut(ptr1.as_ptr(), 8).fill(!0);
			for i in 0..8 {
				ptr0 = realloc(ptr0, NonZeroUsize::new(1usize << i).unwrap()).unwrap();
				ptr1 = realloc(ptr1, NonZeroUsize::new((1usize << i) + 1).unwrap()).unwrap();
			}
			free(ptr1);
			free(ptr0);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn total_allocated_tracks_usage() {
		let before = kmalloc_total_allocated();
		unsafe {
			let ptr = alloc(NonZeroUsize::new(64).unwrap()).unwrap();
			assert!(kmalloc_total_allocated() >= before + 64);
			free(ptr);
		}
		assert_eq!(kmalloc_total_allocated(), before);
	}

	#[test_case]
	fn alloc_is_zeroed() {
		// Invariant 4: a fresh allocation reads back as zero, even from a chunk that previously
		// held a different occupant's data (and this one's free-list links).
		let usage = buddy::allocated_pages_count();
		unsafe {
			let ptr = alloc(NonZeroUsize::new(64).unwrap()).unwrap();
			slice::from_raw_parts_mut(ptr.as_ptr(), 64).fill(!0);
			free(ptr);
			let ptr = alloc(NonZeroUsize::new(64).unwrap()).unwrap();
			assert!(slice::from_raw_parts(ptr.as_ptr(), 64).iter().all(|&b| b == 0));
			free(ptr);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}

	#[test_case]
	fn alloc_spans_multiple_groups() {
		// Each allocation below is bigger than a single default group, forcing the heap to grow
		// more than once; chunks from distinct groups must coexist on the same free list without
		// being mistaken for neighbours.
		let usage = buddy::allocated_pages_count();
		unsafe {
			let a = alloc(NonZeroUsize::new(memory::PAGE_SIZE * 8).unwrap()).unwrap();
			let b = alloc(NonZeroUsize::new(memory::PAGE_SIZE * 8).unwrap()).unwrap();
			assert_ne!(a, b);
			free(a);
			free(b);
		}
		assert_eq!(usage, buddy::allocated_pages_count());
	}
}
