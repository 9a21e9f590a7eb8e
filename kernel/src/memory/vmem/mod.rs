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

//! Address-space management.
//!
//! An [`AddrSpace`] owns a page directory: the kernel's shared half is wired in at creation time
//! (see [`paging::alloc_address_space`]) so every address space sees the same kernel mappings,
//! while the user half is populated lazily as [`AddrSpace::map`] is called.
//!
//! Page-table metadata is always allocated from the kernel zone, which is permanently reachable
//! through [`PhysAddr::kernel_to_virtual`]; walking and editing a directory therefore never
//! requires that directory to be the one currently bound on this CPU. The content of a *data*
//! page is a different matter: pages handed out from the user zone are not part of the direct
//! map, so touching one belonging to an address space that isn't currently bound goes through
//! [`with_temp_map`], which borrows the per-CPU slot of the bound address space's
//! [`paging::TEMP_SLOT`] table for the duration of the access. The table has one entry per logical
//! CPU (`cpu::id()` is always far below [`paging::ENTRIES_PER_TABLE`]), so distinct CPUs never
//! touch the same entry and no lock is needed to serialize them.

use crate::{
	arch::x86::paging::{self, Entry, Table, FLAG_GLOBAL, FLAG_PRESENT, FLAG_USER, FLAG_WRITE},
	cpu, ipm,
	memory::{buddy, frame, PhysAddr, VirtAddr, KERNEL_BEGIN, PAGE_SIZE, PROCESS_END},
	sync::{IntSpin, OnceInit},
};
use core::ptr::NonNull;
use utils::{collections::vec::Vec, errno::AllocResult};

/// Returns the virtual address of the calling CPU's private temporary-mapping window, at slot
/// `cpu::id()` of whichever address space's [`paging::TEMP_SLOT`] table is currently bound here.
fn temp_window() -> VirtAddr {
	VirtAddr((paging::TEMP_SLOT << 22) + cpu::id() * PAGE_SIZE)
}
/// Upper bound for allocations made in the kernel half: the first slot not shared identically by
/// every address space.
const KERNEL_SEARCH_END: VirtAddr = VirtAddr(paging::TEMP_SLOT << 22);

/// The kernel's own address space, bound on every CPU once SMP bring-up starts.
static KERNEL_VMEM: OnceInit<AddrSpace> = unsafe { OnceInit::new() };

/// Returns the kernel's address space.
pub fn kernel() -> &'static AddrSpace {
	&KERNEL_VMEM
}

/// Inner, lock-protected state of an [`AddrSpace`].
struct Inner {
	/// The address space's page directory.
	page_dir: NonNull<Table>,
}

// Safe: the only non-Send field is a raw pointer to memory exclusively owned by this Inner.
unsafe impl Send for Inner {}

/// A page directory and the bookkeeping needed to edit it from any CPU.
pub struct AddrSpace {
	inner: IntSpin<Inner>,
}

impl AddrSpace {
	/// Creates a fresh address space. The kernel's shared tables are already present; the user
	/// half starts out empty.
	pub fn new() -> AllocResult<Self> {
		let page_dir = paging::alloc_address_space()?;
		Ok(Self {
			inner: IntSpin::new(Inner { page_dir }),
		})
	}

	/// Returns the physical address of this address space's page directory.
	pub fn phys_addr(&self) -> PhysAddr {
		let inner = self.inner.lock();
		VirtAddr::from(inner.page_dir.as_ptr())
			.kernel_to_physical()
			.unwrap()
	}

	/// Tells whether this is the address space currently bound on this CPU.
	pub fn is_bound(&self) -> bool {
		self.phys_addr() == paging::current()
	}

	/// Binds this address space as current on this CPU.
	///
	/// # Safety
	///
	/// The address space must map the kernel's own code, data and stack identically to whichever
	/// one it replaces, or execution will fault as soon as this function returns.
	pub unsafe fn bind(&self) {
		unsafe {
			paging::bind(self.phys_addr());
		}
	}

	/// Returns the page table mapped at directory slot `pd_idx`, allocating and wiring in a fresh
	/// one if none is present yet. `user` marks entries created this way as accessible from
	/// userspace.
	fn ensure_table(pd: &Table, pd_idx: usize, user: bool) -> AllocResult<NonNull<Table>> {
		let entry = pd.get(pd_idx);
		if entry & FLAG_PRESENT != 0 {
			return Ok(unsafe { paging::unwrap_entry(entry) }.0);
		}
		let table = paging::alloc_table()?;
		let phys = VirtAddr::from(table.as_ptr()).kernel_to_physical().unwrap();
		let mut flags = FLAG_WRITE | FLAG_GLOBAL;
		if user {
			flags |= FLAG_USER;
		}
		pd.set(pd_idx, paging::to_entry(phys, flags));
		Ok(table)
	}

	/// Tells whether `addr` has a present leaf entry in `pd`.
	fn is_mapped(pd: &Table, addr: VirtAddr) -> bool {
		let entry = pd.get(paging::pd_index(addr));
		if entry & FLAG_PRESENT == 0 {
			return false;
		}
		let (table, _) = unsafe { paging::unwrap_entry(entry) };
		let pt = unsafe { table.as_ref() };
		pt.get(paging::pt_index(addr)) & FLAG_PRESENT != 0
	}

	/// Flushes the TLB for `pages` pages starting at `virt`: locally if this address space is
	/// bound here, and on every other online core through an IPM shootdown.
	fn sync_tlb(&self, virt: VirtAddr, pages: usize) {
		if self.is_bound() {
			for i in 0..pages {
				paging::invalidate_page(virt + i * PAGE_SIZE);
			}
		}
		if cpu::others().1 > 0 {
			ipm::exec_tlb_shootdown(virt, pages);
		}
	}

	/// Maps `pages` pages of physical memory starting at `phys` to `pages` pages of virtual
	/// memory starting at `virt`, with the given raw entry `flags`.
	///
	/// On failure, no entry is left mapped: everything set up by this call is rolled back before
	/// the error is returned.
	///
	/// Mapping over an existing entry is a no-op if the resulting entry would be bitwise-identical
	/// (ignoring accessed/dirty); mapping over one that would change asserts instead of silently
	/// overwriting a mapping some other part of the kernel may still be relying on.
	pub fn map(&self, phys: PhysAddr, virt: VirtAddr, pages: usize, flags: Entry) -> AllocResult<()> {
		debug_assert!(phys.is_aligned_to(PAGE_SIZE));
		debug_assert!(virt.is_aligned_to(PAGE_SIZE));
		let user_half = virt < KERNEL_BEGIN;
		let mut mapped = 0;
		let res = {
			let inner = self.inner.lock();
			let pd = unsafe { inner.page_dir.as_ref() };
			(|| -> AllocResult<()> {
				for i in 0..pages {
					let v = virt + i * PAGE_SIZE;
					let p = phys + i * PAGE_SIZE;
					let table = Self::ensure_table(pd, paging::pd_index(v), user_half)?;
					let pt = unsafe { table.as_ref() };
					let new_entry = paging::to_entry(p, flags);
					let old_entry = pt.get(paging::pt_index(v));
					// Re-mapping the same entry is a no-op (accessed/dirty bits ignored); mapping
					// onto a *different* existing entry is an invariant violation, never a silent
					// overwrite.
					if old_entry & paging::FLAG_PRESENT != 0 {
						let significant = paging::FLAGS_MASK & !(paging::FLAG_ACCESSED | paging::FLAG_DIRTY);
						assert_eq!(
							old_entry & (paging::ADDR_MASK | significant),
							new_entry & (paging::ADDR_MASK | significant),
							"double-map of {:#x} to a conflicting entry", v.0
						);
						mapped = i + 1;
						continue;
					}
					pt.set(paging::pt_index(v), new_entry);
					mapped = i + 1;
				}
				Ok(())
			})()
		};
		if let Err(e) = res {
			self.unmap(virt, mapped);
			return Err(e);
		}
		self.sync_tlb(virt, pages);
		Ok(())
	}

	/// Unmaps `pages` pages of virtual memory starting at `virt`. Addresses that aren't mapped
	/// are silently skipped.
	///
	/// A user-half page table left with no present entry by this call is itself freed and its PDE
	/// cleared, so a later `map`/`unmap` pair of the same range leaves the address space
	/// bitwise-identical to before. Kernel-half tables are never freed: they are pre-allocated once
	/// at address-space construction and shared identically by every address space.
	pub fn unmap(&self, virt: VirtAddr, pages: usize) {
		if pages == 0 {
			return;
		}
		{
			let inner = self.inner.lock();
			let pd = unsafe { inner.page_dir.as_ref() };
			for i in 0..pages {
				let v = virt + i * PAGE_SIZE;
				let entry = pd.get(paging::pd_index(v));
				if entry & FLAG_PRESENT == 0 {
					continue;
				}
				let (table, _) = unsafe { paging::unwrap_entry(entry) };
				let pt = unsafe { table.as_ref() };
				pt.set(paging::pt_index(v), 0);
			}
			// Free any user-half table spanned by this range that is left with no present entry.
			// Kernel-half tables are pre-allocated for the lifetime of the address space and are
			// never freed here; a contiguous range touches every directory slot between its first
			// and last page, so walking that inclusive span covers every table this call could
			// possibly have emptied.
			let last = virt + (pages - 1) * PAGE_SIZE;
			let first_pd_idx = paging::pd_index(virt);
			let last_pd_idx = paging::pd_index(last).min(paging::USERSPACE_TABLES - 1);
			if virt < KERNEL_BEGIN {
				for pd_idx in first_pd_idx..=last_pd_idx {
					let entry = pd.get(pd_idx);
					if entry & FLAG_PRESENT == 0 {
						continue;
					}
					let (table, _) = unsafe { paging::unwrap_entry(entry) };
					let pt = unsafe { table.as_ref() };
					let empty = (0..paging::ENTRIES_PER_TABLE).all(|i| pt.get(i) & FLAG_PRESENT == 0);
					if empty {
						pd.set(pd_idx, 0);
						unsafe {
							paging::free_table(table);
						}
					}
				}
			}
		}
		self.sync_tlb(virt, pages);
	}

	/// Searches `[begin, end)` for `pages` contiguous unmapped pages, returning the address of
	/// the first one.
	pub fn find_contiguous_unmapped(
		&self,
		pages: usize,
		begin: VirtAddr,
		end: VirtAddr,
	) -> Option<VirtAddr> {
		if pages == 0 {
			return Some(begin);
		}
		let inner = self.inner.lock();
		let pd = unsafe { inner.page_dir.as_ref() };
		let mut run_start = begin;
		let mut run_len = 0usize;
		let mut addr = begin;
		while addr < end {
			if Self::is_mapped(pd, addr) {
				addr = addr + PAGE_SIZE;
				run_start = addr;
				run_len = 0;
				continue;
			}
			run_len += 1;
			if run_len == pages {
				return Some(run_start);
			}
			addr = addr + PAGE_SIZE;
		}
		None
	}

	/// Allocates `pages` fresh physical frames and maps them at the first unmapped run of
	/// `pages` virtual pages at or after `above`, with the given raw entry `flags`.
	///
	/// Returns the address the run was mapped at. On failure, every frame allocated by this call
	/// is freed and nothing is left mapped.
	pub fn map_frames_above(&self, above: VirtAddr, pages: usize, flags: Entry) -> AllocResult<VirtAddr> {
		let end = if above < KERNEL_BEGIN {
			PROCESS_END
		} else {
			KERNEL_SEARCH_END
		};
		let virt = self
			.find_contiguous_unmapped(pages, above, end)
			.ok_or(core::alloc::AllocError)?;
		let mut frames = Vec::new();
		let alloc_res = (|| -> AllocResult<()> {
			for _ in 0..pages {
				frames.push(frame::alloc_frame()?)?;
			}
			Ok(())
		})();
		if let Err(e) = alloc_res {
			for phys in frames.iter() {
				unsafe {
					frame::free_frame(*phys);
				}
			}
			return Err(e);
		}
		for (i, phys) in frames.iter().enumerate() {
			if let Err(e) = self.map(*phys, virt + i * PAGE_SIZE, 1, flags) {
				self.unmap(virt, i);
				for phys in frames.iter() {
					unsafe {
						frame::free_frame(*phys);
					}
				}
				return Err(e);
			}
		}
		Ok(virt)
	}
}

impl Drop for AddrSpace {
	fn drop(&mut self) {
		debug_assert!(!self.is_bound(), "dropping the currently bound address space");
		let page_dir = self.inner.lock().page_dir;
		unsafe {
			paging::free_address_space(page_dir);
		}
	}
}

/// Creates a new, empty address space.
pub fn create_new_address_space() -> AllocResult<AddrSpace> {
	AddrSpace::new()
}

/// Destroys `space`, freeing every page table it owns along with every data page still mapped
/// through the user half.
pub fn delete_address_space(space: AddrSpace) {
	drop(space);
}

/// Binds `space` as current on this CPU.
///
/// # Safety
///
/// See [`AddrSpace::bind`].
pub unsafe fn switch_to_address_space(space: &AddrSpace) {
	unsafe {
		space.bind();
	}
}

/// Invalidates the TLB entry for `addr` on this CPU.
///
/// Exposed as a free function so the IPM shootdown handler can flush pages on behalf of a remote
/// address space without naming [`AddrSpace`] at all.
pub fn invalidate_page(addr: VirtAddr) {
	paging::invalidate_page(addr);
}

/// Temporarily maps physical page `phys` into the address space currently bound on this CPU and
/// runs `f` with a pointer to it, then unmaps it.
///
/// This is how the kernel reaches the content of a frame that belongs to the user zone - and so
/// isn't part of the permanent direct map - regardless of which address space logically owns it.
/// Each CPU uses its own entry of the bound directory's [`paging::TEMP_SLOT`] table
/// (`cpu::id()`-indexed), so concurrent callers on different CPUs never contend for the same PTE
/// and no lock is taken here.
pub fn with_temp_map<R>(phys: PhysAddr, f: impl FnOnce(*mut u8) -> R) -> R {
	debug_assert!(phys.is_aligned_to(PAGE_SIZE));
	let slot = cpu::id();
	debug_assert!(slot < paging::ENTRIES_PER_TABLE);
	let window = temp_window();
	let dir = paging::current().kernel_to_virtual().unwrap().as_ptr::<Table>();
	let pd = unsafe { &*dir };
	let (table, _) = unsafe { paging::unwrap_entry(pd.get(paging::TEMP_SLOT)) };
	let pt = unsafe { table.as_ref() };
	pt.set(slot, paging::to_entry(phys, FLAG_WRITE | FLAG_GLOBAL));
	paging::invalidate_page(window);
	let ret = f(window.as_ptr());
	pt.set(slot, 0);
	paging::invalidate_page(window);
	ret
}

/// Builds the kernel's address space and binds it on the boot CPU, replacing the boot-time
/// identity map set up in assembly.
///
/// Maps every physical page below the end of the kernel zone (the kernel image, the buddy
/// allocator's own metadata, and the kernel zone itself) into the kernel's direct map. The user
/// zone is left unmapped: its frames are reached only through [`with_temp_map`] once they're
/// handed out.
pub(crate) fn init() -> AllocResult<()> {
	paging::init()?;
	let space = AddrSpace::new()?;
	let (kzone_begin, kzone_pages) = buddy::kernel_zone_range();
	let low_pages = kzone_begin.0 / PAGE_SIZE + kzone_pages;
	space.map(PhysAddr(0), KERNEL_BEGIN, low_pages, FLAG_WRITE | FLAG_GLOBAL)?;
	unsafe {
		space.bind();
		OnceInit::init(&KERNEL_VMEM, space);
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::buddy::FLAG_ZONE_TYPE_KERNEL;

	#[test_case]
	fn vmem_create_destroy() {
		let space = create_new_address_space().unwrap();
		assert!(!space.is_bound());
		delete_address_space(space);
	}

	#[test_case]
	fn vmem_map_unmap_roundtrip() {
		let space = kernel();
		let phys = frame::alloc_frame().unwrap();
		let base = PhysAddr(0).kernel_to_virtual().unwrap() + 0x10000000;
		let virt = space
			.find_contiguous_unmapped(1, base, KERNEL_SEARCH_END)
			.unwrap();
		space.map(phys, virt, 1, FLAG_WRITE | FLAG_GLOBAL).unwrap();
		unsafe {
			let ptr = virt.as_ptr::<u32>();
			ptr.write_volatile(0xdead_beef);
			assert_eq!(ptr.read_volatile(), 0xdead_beef);
		}
		space.unmap(virt, 1);
		unsafe {
			frame::free_frame(phys);
		}
	}

	#[test_case]
	fn vmem_map_frames_above() {
		let space = kernel();
		let above = PhysAddr(0).kernel_to_virtual().unwrap() + 0x20000000;
		let virt = space.map_frames_above(above, 4, FLAG_WRITE | FLAG_GLOBAL).unwrap();
		for i in 0..4 {
			unsafe {
				let ptr = (virt + i * PAGE_SIZE).as_ptr::<u8>();
				ptr.write_volatile(i as u8);
				assert_eq!(ptr.read_volatile(), i as u8);
			}
		}
		space.unmap(virt, 4);
	}

	#[test_case]
	fn vmem_find_contiguous_skips_mapped() {
		let space = kernel();
		let base = PhysAddr(0).kernel_to_virtual().unwrap() + 0x30000000;
		let phys = frame::alloc_frame().unwrap();
		space.map(phys, base + PAGE_SIZE, 1, FLAG_WRITE | FLAG_GLOBAL).unwrap();
		let found = space
			.find_contiguous_unmapped(1, base, base + 3 * PAGE_SIZE)
			.unwrap();
		assert_ne!(found, base + PAGE_SIZE);
		space.unmap(base + PAGE_SIZE, 1);
		unsafe {
			frame::free_frame(phys);
		}
	}

	#[test_case]
	fn vmem_idempotent_remap_and_table_reclaim() {
		// S1: mapping the same (phys, virt, flags) twice is a no-op, and unmapping afterward
		// leaves the address space exactly as it was before the first `map`, table included.
		let space = AddrSpace::new().unwrap();
		let phys = frame::alloc_frame().unwrap();
		let virt = VirtAddr(0x1000_0000);
		let before = buddy::allocated_pages_count();
		space.map(phys, virt, 1, FLAG_WRITE | FLAG_USER).unwrap();
		space.map(phys, virt, 1, FLAG_WRITE | FLAG_USER).unwrap();
		space.unmap(virt, 1);
		assert_eq!(buddy::allocated_pages_count(), before);
		unsafe {
			frame::free_frame(phys);
		}
		delete_address_space(space);
	}

	// A conflicting double-map (same address, different frame/flags) is deliberately not exercised
	// here: it is a fatal invariant violation (`assert_eq!` above), and this kernel's test harness
	// runs with `panic = abort` and no unwinding, so a panicking test would take the whole suite
	// down with it rather than being caught as a failure.

	#[test_case]
	fn vmem_temp_map_round_trip() {
		let phys = frame::alloc_frame().unwrap();
		with_temp_map(phys, |ptr| unsafe {
			core::ptr::write_bytes(ptr, 0, PAGE_SIZE);
			ptr.cast::<u32>().write_volatile(0xcafe_babe);
		});
		// The window is torn down as soon as `with_temp_map` returns: re-entering it for the same
		// frame must read back what was just written, not stale content from another slot.
		with_temp_map(phys, |ptr| unsafe {
			assert_eq!(ptr.cast::<u32>().read_volatile(), 0xcafe_babe);
		});
		unsafe {
			frame::free_frame(phys);
		}
	}

	#[test_case]
	fn vmem_temp_map_uses_cpu_local_slot() {
		// The window address is derived from `cpu::id()`, not a fixed slot: on the registered
		// calling CPU it must fall inside the TEMP_SLOT region at exactly that CPU's offset.
		let expected = VirtAddr((paging::TEMP_SLOT << 22) + cpu::id() * PAGE_SIZE);
		assert_eq!(temp_window(), expected);
	}

	#[test_case]
	fn vmem_delete_address_space_frees_data_pages() {
		// §4.2: destroying an address space frees the user-half tables *and* the data pages they
		// reference, not just the tables.
		let space = AddrSpace::new().unwrap();
		let phys = frame::alloc_frame().unwrap();
		let virt = VirtAddr(0x2000_0000);
		let before = buddy::allocated_pages_count();
		space.map(phys, virt, 1, FLAG_WRITE | FLAG_USER).unwrap();
		assert_eq!(buddy::allocated_pages_count(), before + 1);
		delete_address_space(space);
		assert_eq!(buddy::allocated_pages_count(), before);
	}

	#[test_case]
	fn vmem_vga_text_still_reachable() {
		// The low 1MiB, VGA buffer included, is covered by the kernel zone's direct map.
		let _ = FLAG_ZONE_TYPE_KERNEL;
		let ptr = crate::tty::vga::get_buffer_virt();
		assert!(!ptr.is_null());
	}
}
