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

//! A process is a schedulable unit of execution: a kernel stack plus the saved register state
//! the CPU had when it was last switched out.
//!
//! The user-space process ABI (file descriptors, signals, memory mappings, `exec`, `fork`) is out
//! of scope for this core; a process here is opaque beyond what the scheduler needs to run it.

pub mod scheduler;

use crate::memory::buddy::{self, FrameOrder};
use crate::arch::x86::idt::IntFrame;
use core::ptr::NonNull;
use utils::errno::AllocResult;

/// The order of the buddy allocation backing a process's kernel stack (8 pages).
const KERNEL_STACK_ORDER: FrameOrder = 3;

/// Segment selector of the kernel code segment, set up by the flat GDT installed at boot.
const KERNEL_CS: u32 = 0x08;
/// Segment selector of the kernel data segment, set up by the flat GDT installed at boot.
const KERNEL_DS: u32 = 0x10;

/// A process's scheduling state.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum State {
	/// The process may be scheduled to run.
	Runnable,
	/// The process has exited and is waiting to be reaped by the scheduler.
	Dead,
}

/// A schedulable task.
///
/// Intrusive run-queue links let the scheduler's policy keep processes in a list without a
/// separate heap-allocated node; a process belongs to at most one run queue at a time.
pub struct Process {
	/// The saved register state, restored into the interrupt frame when this process is resumed.
	regs: IntFrame,
	/// Base of the kernel stack backing this process, freed on drop.
	kernel_stack: NonNull<u8>,
	/// The process's scheduling state.
	state: State,
	/// Logical id of the CPU this process last ran on, or is currently assigned to.
	cpu: usize,
	/// Whether this is the CPU's idle process.
	///
	/// Idle processes are never placed on a run queue; the scheduler parks them in a dedicated
	/// per-CPU slot and picks them only as a fallback.
	is_idle: bool,

	/// Previous process in the run queue it belongs to.
	prev: Option<NonNull<Process>>,
	/// Next process in the run queue it belongs to.
	next: Option<NonNull<Process>>,
}

impl Process {
	/// Creates a new process whose first instruction, once scheduled, is `entry`.
	///
	/// `entry` never returns: there is no caller to return to, since the process starts with an
	/// empty call stack.
	pub fn new(entry: extern "C" fn() -> !) -> AllocResult<alloc::boxed::Box<Self>> {
		let kernel_stack = buddy::alloc_kernel(KERNEL_STACK_ORDER)?;
		let stack_size = buddy::get_frame_size(KERNEL_STACK_ORDER);
		let stack_top = unsafe { kernel_stack.as_ptr().cast::<u8>().add(stack_size) } as u32;
		let regs = IntFrame {
			eax: 0,
			ebx: 0,
			ecx: 0,
			edx: 0,
			esi: 0,
			edi: 0,
			ebp: 0,

			int: 0,
			code: 0,

			eip: entry as usize as u32,
			cs: KERNEL_CS,
			eflags: crate::arch::x86::DEFAULT_FLAGS as u32,
			esp: stack_top,
			ss: KERNEL_DS,
		};
		alloc::boxed::Box::try_new(Self {
			regs,
			kernel_stack: NonNull::new(kernel_stack.as_ptr().cast()).unwrap(),
			state: State::Runnable,
			cpu: usize::MAX,
			is_idle: false,

			prev: None,
			next: None,
		})
		.map_err(|_| utils::errno::AllocError)
	}

	/// Creates a new idle process: the trivial task a CPU's scheduler falls back to when its run
	/// queue is empty. `entry` should never return and should halt with interrupts enabled while
	/// waiting for work.
	pub(crate) fn new_idle(entry: extern "C" fn() -> !) -> AllocResult<alloc::boxed::Box<Self>> {
		let mut proc = Self::new(entry)?;
		proc.is_idle = true;
		Ok(proc)
	}

	/// Tells whether this is a CPU's idle process.
	#[inline]
	pub(crate) fn is_idle(&self) -> bool {
		self.is_idle
	}

	/// Returns the process's current scheduling state.
	#[inline]
	pub fn state(&self) -> State {
		self.state
	}

	/// Sets the process's scheduling state.
	#[inline]
	pub fn set_state(&mut self, state: State) {
		self.state = state;
	}

	/// Returns the id of the CPU this process last ran on, or `usize::MAX` if it never ran.
	#[inline]
	pub fn cpu(&self) -> usize {
		self.cpu
	}

	/// Sets the id of the CPU this process is assigned to.
	#[inline]
	pub fn set_cpu(&mut self, cpu: usize) {
		self.cpu = cpu;
	}

	/// Copies this process's saved registers into `frame`, to resume it.
	pub(crate) fn restore_into(&self, frame: &mut IntFrame) {
		*frame = self.regs;
	}

	/// Saves `frame` as this process's register state, as it is switched out.
	pub(crate) fn save_from(&mut self, frame: &IntFrame) {
		self.regs = *frame;
	}
}

impl Drop for Process {
	fn drop(&mut self) {
		unsafe {
			buddy::free_kernel(self.kernel_stack.as_ptr().cast(), KERNEL_STACK_ORDER);
		}
	}
}
