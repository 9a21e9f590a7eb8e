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

//! Maestro is a Unix kernel written in Rust. This reference documents
//! interfaces for modules and the kernel's internals.
//!
//! This build covers the memory and concurrency core: the physical frame allocator, the
//! address-space manager, the kernel heap, the inter-processor messaging bus and the
//! multi-core scheduler. There is no filesystem, no userspace ABI and no device stack; the
//! kernel's only workload is its own self-tests and its per-CPU idle loops.

#![no_std]
#![no_main]
#![feature(adt_const_params)]
#![feature(alloc_layout_extra)]
#![feature(allocator_api)]
#![feature(allow_internal_unstable)]
#![feature(array_chunks)]
#![feature(custom_test_frameworks)]
#![feature(debug_closure_helpers)]
#![feature(lang_items)]
#![feature(likely_unlikely)]
#![feature(negative_impls)]
#![feature(non_null_from_ref)]
#![feature(offset_of_enum)]
#![feature(once_cell_try)]
#![feature(pointer_is_aligned_to)]
#![feature(ptr_metadata)]
#![feature(strict_provenance_lints)]
#![feature(unsigned_nonzero_div_ceil)]
#![deny(fuzzy_provenance_casts)]
#![deny(missing_docs)]
#![allow(clippy::tabs_in_doc_comments)]
#![allow(dead_code)]
#![allow(incomplete_features)]
#![allow(internal_features)]
#![allow(unsafe_op_in_unsafe_fn)]
#![test_runner(crate::selftest::runner)]
#![reexport_test_harness_main = "kernel_selftest"]

extern crate alloc;

pub mod acpi;
pub mod arch;
mod boot;
#[macro_use]
pub mod config;
pub mod cpu;
pub mod int;
pub mod ipm;
pub mod logger;
pub mod memory;
pub mod multiboot;
#[macro_use]
pub mod panic;
pub mod power;
#[macro_use]
pub mod print;
pub mod process;
pub mod selftest;
pub mod sync;
pub mod tty;

use crate::{
	arch::x86::smp,
	memory::{malloc::KernelAlloc, vmem},
	process::scheduler,
	tty::TTY,
};
use core::ffi::c_void;
pub use utils;

/// The kernel's name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
/// Current kernel version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The kernel's global heap allocator.
///
/// Backed by [`memory::buddy`] through [`memory::malloc`]'s address-sorted, eagerly-coalescing
/// free lists. Every `alloc`-crate type used throughout the kernel (`Box`, `Vec`, ...) goes
/// through this.
#[global_allocator]
static ALLOCATOR: KernelAlloc = KernelAlloc;

/// An inner function is required to ensure everything in scope is dropped before the CPU falls
/// into its idle loop.
fn kernel_main_inner(magic: u32, multiboot_ptr: *const c_void) {
	// Initialize TTY
	TTY.display.lock().show();
	// Architecture-specific initialization
	arch::init();

	println!("Boot {NAME} version {VERSION}");

	// Read multiboot information
	let boot_info = unsafe { multiboot::read(magic, multiboot_ptr) };

	// Initialize memory management
	println!("Setup memory management");
	memory::memmap::init(&boot_info);
	memory::alloc::init();
	vmem::init().expect("cannot initialize virtual memory management");

	// From now on, the kernel considers that memory management has been fully initialized.

	// Register the bootstrap processor before anything that assumes a logical CPU id exists,
	// self-tests included.
	cpu::register(arch::x86::apic::lapic_id());

	// Perform kernel self-tests
	#[cfg(test)]
	kernel_selftest();

	println!("Find ACPI structures");
	acpi::init().expect("ACPI initialization failed");

	println!("Setup inter-processor messaging");
	ipm::init();

	println!("Setup SMP");
	let (apic_ids, n) = cpu::registered_apic_ids();
	smp::init(&apic_ids[..n]);

	println!("Setup scheduler");
	scheduler::sched_init();
	scheduler::sched_start();
}

/// This is the main function of the Rust source code, responsible for the
/// initialization of the kernel.
///
/// When calling this function, the CPU must be in Protected Mode with the GDT loaded with space
/// for the Task State Segment.
///
/// Arguments:
/// - `magic` is the magic number passed by Multiboot.
/// - `multiboot_ptr` is the pointer to the Multiboot booting information structure.
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main(magic: u32, multiboot_ptr: *const c_void) -> ! {
	kernel_main_inner(magic, multiboot_ptr);
	// `schedule` never actually returns here: the software interrupt it raises switches this
	// CPU's interrupt frame to its idle process on the way out. The loop only guards against
	// the (never taken) case where `sched_resched` declines to switch.
	loop {
		scheduler::schedule();
	}
}
