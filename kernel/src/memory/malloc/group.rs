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

//! In the malloc allocator, a group is a run of virtually-mapped kernel pages carved out of the
//! address space on demand, too big to hand out directly, so it is divided into chunks.
//!
//! Unlike a plain physical allocation, a group's pages are obtained one at a time from
//! [`frame::alloc_frame`] and mapped individually through [`vmem::kernel`]'s address space, which
//! is how the heap grows through the address-space manager rather than reaching into the buddy
//! allocator directly.

use super::chunk::{Chunk, FreeChunk};
use crate::{
	arch::x86::paging::{self, Entry},
	memory::{frame, vmem, PhysAddr, VirtAddr, KERNEL_BEGIN, PAGE_SIZE},
};
use core::{
	mem::{offset_of, size_of},
	num::NonZeroUsize,
	ptr,
};
use utils::errno::{AllocError, AllocResult};

/// Raw entry flags used to map a group's pages: writable and global, since the heap lives in the
/// kernel's shared half and must stay valid across every address-space switch.
const GROUP_FLAGS: Entry = paging::FLAG_WRITE | paging::FLAG_GLOBAL;

/// Starting point for the search for a new group's virtual range. Comfortably past the end of the
/// kernel's direct map, leaving room below it for other kernel-space users.
const SEARCH_START: VirtAddr = VirtAddr(KERNEL_BEGIN.0 + 0x10000000);

/// Upper bound for the search: the slot below which every address space maps the kernel
/// identically stops being usable once the private per-address-space slots begin.
const SEARCH_END: VirtAddr = VirtAddr(paging::TEMP_SLOT << 22);

/// Maximum number of pages a single group may span. Bounds the inline frame table below so that
/// growing the heap never itself needs to allocate.
const MAX_GROUP_PAGES: usize = 256;

/// A run of mapped kernel pages, storing memory chunks.
#[repr(C, align(8))]
pub struct Group {
	/// Base virtual address of the group.
	base: VirtAddr,
	/// Number of pages composing the group.
	pages: usize,
	/// Physical frame backing each page of the group, in order.
	frames: [PhysAddr; MAX_GROUP_PAGES],
	/// The first chunk of the group.
	pub first_chunk: Chunk,
}

impl Group {
	/// Maps a new group of memory with at least `min_size` bytes available for allocation.
	///
	/// The underlying chunk created by this function is **not** inserted into the free list.
	pub fn new(min_size: NonZeroUsize) -> AllocResult<&'static mut Self> {
		let min_total_size = size_of::<Self>() + min_size.get();
		let pages = min_total_size.div_ceil(PAGE_SIZE).max(1);
		if pages > MAX_GROUP_PAGES {
			return Err(AllocError);
		}
		let base = vmem::kernel()
			.find_contiguous_unmapped(pages, SEARCH_START, SEARCH_END)
			.ok_or(AllocError)?;
		let mut frames = [PhysAddr::default(); MAX_GROUP_PAGES];
		if let Err((e, done)) = Self::map_pages(base, pages, &mut frames) {
			Self::unmap_pages(base, done, &frames);
			return Err(e);
		}
		let first_chunk_size = pages * PAGE_SIZE - size_of::<Self>();
		let group = unsafe {
			let ptr = base.as_ptr::<Self>();
			ptr::write_volatile(
				ptr,
				Self {
					base,
					pages,
					frames,
					first_chunk: Chunk::new(),
				},
			);
			&mut *ptr
		};
		*group.first_chunk.as_free_chunk().unwrap() = FreeChunk::new(first_chunk_size);
		Ok(group)
	}

	/// Allocates and maps `pages` frames starting at `base`, filling `frames` in order.
	///
	/// On failure, returns the error alongside the number of pages that were mapped before it
	/// occurred, which the caller must roll back with [`Self::unmap_pages`].
	fn map_pages(
		base: VirtAddr,
		pages: usize,
		frames: &mut [PhysAddr],
	) -> Result<(), (AllocError, usize)> {
		for i in 0..pages {
			let phys = frame::alloc_frame().map_err(|e| (e, i))?;
			frames[i] = phys;
			if let Err(e) = vmem::kernel().map(phys, base + i * PAGE_SIZE, 1, GROUP_FLAGS) {
				unsafe {
					frame::free_frame(phys);
				}
				return Err((e, i));
			}
		}
		Ok(())
	}

	/// Unmaps and frees the first `done` pages of a group starting at `base`.
	fn unmap_pages(base: VirtAddr, done: usize, frames: &[PhysAddr]) {
		if done == 0 {
			return;
		}
		vmem::kernel().unmap(base, done);
		for phys in &frames[..done] {
			unsafe {
				frame::free_frame(*phys);
			}
		}
	}

	/// Returns a mutable reference to the group whose first chunk's reference is passed as
	/// argument.
	pub unsafe fn from_first_chunk(chunk: *mut Chunk) -> &'static mut Group {
		let first_chunk_off = offset_of!(Group, first_chunk);
		let ptr = ((chunk as usize) - first_chunk_off) as *mut Self;
		debug_assert!(ptr.is_aligned_to(PAGE_SIZE));
		unsafe { &mut *ptr }
	}
}

impl Drop for Group {
	fn drop(&mut self) {
		vmem::kernel().unmap(self.base, self.pages);
		for phys in &self.frames[..self.pages] {
			unsafe {
				frame::free_frame(*phys);
			}
		}
	}
}
