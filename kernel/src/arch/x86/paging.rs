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

//! Raw x86 paging structures: page directories and page tables.
//!
//! A page directory/page table is an array of 1024 32-bit descriptors. Each entry carries a
//! 20-bit frame number plus flag bits (present, writable, user, ...).
//!
//! Entries are stored as [`AtomicUsize`] rather than a plain integer so that the boot-time
//! identity-mapping directory (a `static mut` poked at by both Rust and the CPU, which sets the
//! dirty bit on its own) never exposes a data race, and so that a page table can be read through
//! the recursive mapping while another core is concurrently splitting a huge neighbouring entry.
//!
//! Page Size Extension (4MB) entries are supported here only because the boot-time identity map
//! is built with them before the real kernel address space exists; the address-space manager
//! built on top of this module never produces one itself.

use crate::memory::{buddy, PhysAddr, VirtAddr, PAGE_SIZE};
use core::{
	ffi::c_void,
	ops::{Deref, DerefMut},
	ptr::NonNull,
	sync::atomic::{AtomicUsize, Ordering::Relaxed},
};
use utils::errno::AllocResult;

/// A raw page directory / page table entry.
pub type Entry = usize;

/// **x86 paging flag**: If set, prevents the CPU from updating the associated
/// addresses when the TLB is flushed.
pub const FLAG_GLOBAL: Entry = 0b100000000;
/// **x86 paging flag**: If set, the entry maps a 4MB page directly (PSE). Only used by the
/// boot-time identity map.
pub const FLAG_PAGE_SIZE: Entry = 0b010000000;
/// **x86 paging flag**: Indicates that the page has been written.
pub const FLAG_DIRTY: Entry = 0b001000000;
/// **x86 paging flag**: Set if the page has been read or written.
pub const FLAG_ACCESSED: Entry = 0b000100000;
/// **x86 paging flag**: If set, page will not be cached.
pub const FLAG_CACHE_DISABLE: Entry = 0b000010000;
/// **x86 paging flag**: If set, write-through caching is enabled. If not, write-back is used.
pub const FLAG_WRITE_THROUGH: Entry = 0b000001000;
/// **x86 paging flag**: If set, the page can be accessed by userspace operations.
pub const FLAG_USER: Entry = 0b000000100;
/// **x86 paging flag**: If set, the page can be written.
pub const FLAG_WRITE: Entry = 0b000000010;
/// **x86 paging flag**: If set, the page is present.
pub const FLAG_PRESENT: Entry = 0b000000001;

/// Flags mask in a page directory entry.
pub const FLAGS_MASK: Entry = 0xfff;
/// Address mask in a page directory entry.
pub const ADDR_MASK: Entry = !FLAGS_MASK;

/// x86 page fault flag. If set, the page was present.
pub const PAGE_FAULT_PRESENT: u32 = 0b00001;
/// x86 page fault flag. If set, the fault was caused by a write, else a read.
pub const PAGE_FAULT_WRITE: u32 = 0b00010;
/// x86 page fault flag. If set, the fault was caused by a userspace operation.
pub const PAGE_FAULT_USER: u32 = 0b00100;
/// x86 page fault flag. If set, a reserved bit was set in one of the entries walked.
pub const PAGE_FAULT_RESERVED: u32 = 0b01000;
/// x86 page fault flag. If set, the fault was caused by an instruction fetch.
pub const PAGE_FAULT_INSTRUCTION: u32 = 0b10000;

/// Number of entries in a page directory or page table.
pub const ENTRIES_PER_TABLE: usize = 1024;
/// Number of page-directory slots reserved for userspace (the low half).
pub const USERSPACE_TABLES: usize = 768;
/// Page-directory slot holding the per-address-space temporary-mapping page table.
pub const TEMP_SLOT: usize = 1022;
/// Page-directory slot holding the recursive self-mapping entry.
pub const RECURSIVE_SLOT: usize = 1023;
/// Number of page-directory slots shared, bit-for-bit, by every address space.
pub const KERNEL_SHARED_TABLES: usize = TEMP_SLOT - USERSPACE_TABLES;

/// Flags used for entries mapping the kernel's shared page tables.
const KERNEL_FLAGS: Entry = FLAG_PRESENT | FLAG_WRITE | FLAG_GLOBAL;

/// A page directory or page table: 1024 raw entries.
#[repr(C, align(4096))]
pub struct Table(pub [AtomicUsize; ENTRIES_PER_TABLE]);

impl Table {
	/// Returns a zeroed table, suitable for `const` initializers.
	pub const fn new() -> Self {
		#[allow(clippy::declare_interior_mutable_const)]
		const ZERO: AtomicUsize = AtomicUsize::new(0);
		Self([ZERO; ENTRIES_PER_TABLE])
	}

	/// Reads the entry at `index`.
	#[inline]
	pub fn get(&self, index: usize) -> Entry {
		self.0[index].load(Relaxed)
	}

	/// Writes `entry` at `index`.
	#[inline]
	pub fn set(&self, index: usize, entry: Entry) {
		self.0[index].store(entry, Relaxed);
	}
}

impl Default for Table {
	fn default() -> Self {
		Self::new()
	}
}

impl Deref for Table {
	type Target = [AtomicUsize; ENTRIES_PER_TABLE];

	fn deref(&self) -> &Self::Target {
		&self.0
	}
}

impl DerefMut for Table {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.0
	}
}

/// The kernel's shared page tables, indexed `0..KERNEL_SHARED_TABLES`, pointed to identically by
/// the PDE at `USERSPACE_TABLES + i` of every address space.
static KERNEL_TABLES: crate::sync::IntSpin<[*mut Table; KERNEL_SHARED_TABLES]> =
	crate::sync::IntSpin::new([core::ptr::null_mut(); KERNEL_SHARED_TABLES]);

/// Allocates a zeroed table and returns its virtual address.
pub fn alloc_table() -> AllocResult<NonNull<Table>> {
	let table = buddy::alloc_kernel(0)?.cast::<Table>();
	unsafe {
		table.as_ptr().write(Table::new());
	}
	Ok(table)
}

/// Frees a table previously returned by [`alloc_table`].
///
/// # Safety
///
/// The table must not be referenced by any live page directory afterward.
pub unsafe fn free_table(table: NonNull<Table>) {
	buddy::free_kernel(table.as_ptr() as _, 0);
}

/// Encodes `(addr, flags)` into a raw entry, forcing the present bit.
#[inline]
pub fn to_entry(addr: PhysAddr, flags: Entry) -> Entry {
	(addr.0 & !0xfff) | (flags & FLAGS_MASK) | FLAG_PRESENT
}

/// Splits a raw entry back into `(table virtual address, flags)`.
///
/// # Safety
///
/// The entry's address bits must designate a table mapped in the kernel's direct map.
pub unsafe fn unwrap_entry(entry: Entry) -> (NonNull<Table>, Entry) {
	let table = PhysAddr(entry & ADDR_MASK)
		.kernel_to_virtual()
		.unwrap()
		.as_ptr::<Table>();
	(NonNull::new(table).unwrap(), entry & FLAGS_MASK)
}

/// Returns the page-directory index for virtual address `addr`.
#[inline]
pub fn pd_index(addr: VirtAddr) -> usize {
	(addr.0 >> 22) & 0x3ff
}

/// Returns the page-table index for virtual address `addr`.
#[inline]
pub fn pt_index(addr: VirtAddr) -> usize {
	(addr.0 >> 12) & 0x3ff
}

/// Allocates a fresh page directory with the kernel's shared half pre-wired in, plus a private
/// temporary-mapping table at [`TEMP_SLOT`] and the recursive entry at [`RECURSIVE_SLOT`].
pub fn alloc_address_space() -> AllocResult<NonNull<Table>> {
	let page_dir = alloc_table()?;
	let pd = unsafe { page_dir.as_ref() };
	{
		let kernel_tables = KERNEL_TABLES.lock();
		for (i, src) in kernel_tables.iter().enumerate() {
			let addr = VirtAddr::from(*src).kernel_to_physical().unwrap();
			pd.set(USERSPACE_TABLES + i, to_entry(addr, KERNEL_FLAGS));
		}
	}
	let temp_table = alloc_table()?;
	let temp_phys = VirtAddr::from(temp_table.as_ptr()).kernel_to_physical().unwrap();
	pd.set(TEMP_SLOT, to_entry(temp_phys, FLAG_WRITE | FLAG_GLOBAL));
	let self_phys = VirtAddr::from(page_dir.as_ptr()).kernel_to_physical().unwrap();
	pd.set(RECURSIVE_SLOT, to_entry(self_phys, FLAG_WRITE | FLAG_GLOBAL));
	Ok(page_dir)
}

/// Destroys a page directory created by [`alloc_address_space`], along with its temporary-mapping
/// table, every user-half table still present, and every data page those tables' present entries
/// still reference.
///
/// # Safety
///
/// `page_dir` must not be loaded (via CR3) on any CPU.
pub unsafe fn free_address_space(page_dir: NonNull<Table>) {
	let pd = page_dir.as_ref();
	for i in 0..USERSPACE_TABLES {
		let entry = pd.get(i);
		if entry & FLAG_PRESENT == 0 {
			continue;
		}
		let (table, _) = unwrap_entry(entry);
		let pt = table.as_ref();
		for j in 0..ENTRIES_PER_TABLE {
			let pte = pt.get(j);
			if pte & FLAG_PRESENT != 0 {
				buddy::free((pte & ADDR_MASK) as *const c_void, 0);
			}
		}
		free_table(table);
	}
	let temp_entry = pd.get(TEMP_SLOT);
	free_table(unwrap_entry(temp_entry).0);
	free_table(page_dir);
}

/// Binds `page_dir` (a physical address) as the current CPU's active address space.
///
/// # Safety
///
/// The directory must map the kernel's own code, data, and stack.
#[inline]
pub unsafe fn bind(page_dir: PhysAddr) {
	use core::arch::asm;
	asm!("mov cr3, {dir}", dir = in(reg) page_dir.0);
}

/// Returns the physical address of the page directory currently bound on this CPU.
#[inline]
pub fn current() -> PhysAddr {
	PhysAddr(crate::register_get!("cr3"))
}

/// Invalidates the TLB entry for a single page on the current CPU.
#[inline]
pub fn invalidate_page(addr: VirtAddr) {
	unsafe {
		core::arch::asm!("invlpg [{addr}]", addr = in(reg) addr.0);
	}
}

/// Flushes the whole TLB on the current CPU by reloading CR3.
pub fn flush_current() {
	unsafe {
		core::arch::asm!(
			"mov {tmp}, cr3",
			"mov cr3, {tmp}",
			tmp = out(reg) _
		);
	}
}

/// Initializes the kernel's shared page tables. Must run once at boot, before any address space
/// is created.
pub fn init() -> AllocResult<()> {
	let mut cr4 = crate::register_get!("cr4") | 1 << 7; // global pages
	let (smep, smap) = super::supports_supervisor_prot();
	if smep {
		cr4 |= 1 << 20;
	}
	if smap {
		cr4 |= 1 << 21;
	}
	unsafe {
		crate::register_set!("cr4", cr4);
	}
	let mut tables = KERNEL_TABLES.lock();
	for table in tables.iter_mut() {
		*table = alloc_table()?.as_ptr();
	}
	Ok(())
}

const _: () = assert!(PAGE_SIZE == 4096);
