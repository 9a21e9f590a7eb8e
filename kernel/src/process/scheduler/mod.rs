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

//! Multi-core scheduler.
//!
//! Every CPU owns a run queue reachable only through a pluggable [`Policy`], a dedicated idle
//! process, and a handful of flags. The LAPIC timer ticks a CPU roughly every
//! [`TICK_PERIOD_MS`] milliseconds; [`sched_resched`] is then called on the way out of *every*
//! interrupt (not just the tick) and decides whether to actually switch, since a tick is only
//! one of several reasons a reschedule might be due (a remote call may have just woken up a
//! process on an otherwise idle core, for instance).
//!
//! There is no separate stack-swap routine: a process is fully described by a saved
//! [`IntFrame`], so "switching" just means copying that frame over the one the interrupt
//! trampoline is about to `iret` with ([`Process::restore_into`]/[`Process::save_from`]). This is
//! also why [`schedule`], the one entry point meant to be called outside of interrupt context,
//! works by raising a software interrupt: it is the only place a frame exists to switch through.

pub mod switch;

use crate::{
	arch::x86::{apic, idt::IntFrame},
	cpu,
	int::{self, CallbackResult},
	process::{Process, State},
	sync::IntSpin,
};
use alloc::boxed::Box;
use core::{
	arch::asm,
	ptr::NonNull,
	sync::atomic::{
		AtomicBool, AtomicU64,
		Ordering::{AcqRel, Acquire, Relaxed, Release},
	},
};

/// Interrupt vector the LAPIC timer ticks the scheduler on.
const TICK_VECTOR: u8 = 0x22;
/// Interrupt vector [`schedule`] raises to force a reschedule check outside of interrupt context.
const RESCHED_VECTOR: u8 = 0x23;

/// The scheduler tick period, in milliseconds, read from `default.build-config.toml`.
const TICK_PERIOD_MS: u64 = crate::build_cfg!(config_scheduler_tick_period_ms);

/// An intrusive, FIFO-ordered run queue.
///
/// Built directly on [`Process`]'s `prev`/`next` links: since this module is a descendant of
/// [`crate::process`], it can reach those private fields without the owning module exposing any
/// accessor for them.
struct RunQueue {
	head: Option<NonNull<Process>>,
	tail: Option<NonNull<Process>>,
	len: usize,
}

// A `RunQueue` only ever holds processes it owns exclusively behind a CPU's spinlock; the raw
// pointers inside it are never read without that lock held.
unsafe impl Send for RunQueue {}

impl RunQueue {
	const fn new() -> Self {
		Self {
			head: None,
			tail: None,
			len: 0,
		}
	}

	fn push_back(&mut self, mut proc: Box<Process>) {
		proc.prev = self.tail;
		proc.next = None;
		let ptr = NonNull::from(Box::leak(proc));
		match self.tail {
			Some(tail) => unsafe { (*tail.as_ptr()).next = Some(ptr) },
			None => self.head = Some(ptr),
		}
		self.tail = Some(ptr);
		self.len += 1;
	}

	fn pop_front(&mut self) -> Option<Box<Process>> {
		let ptr = self.head?;
		// Safe: `ptr` was leaked from a `Box` in `push_back` and is still exclusively owned by
		// this queue.
		let proc = unsafe { Box::from_raw(ptr.as_ptr()) };
		self.head = proc.next;
		match self.head {
			Some(next) => unsafe { (*next.as_ptr()).prev = None },
			None => self.tail = None,
		}
		self.len -= 1;
		Some(proc)
	}
}

/// A pluggable scheduling policy.
///
/// A policy owns the run queue data structure for every CPU and decides placement and ordering;
/// the scheduler core (this module) owns only the idle process, the currently-running process,
/// and the reschedule flags, and calls into the policy at the points named below.
pub trait Policy: Sync {
	/// Prepares the policy's per-CPU state for CPU `id`. Called once, during [`sched_init`].
	fn init(&self, id: usize);
	/// Places `proc` onto CPU `id`'s run queue.
	fn enqueue(&self, id: usize, proc: Box<Process>);
	/// Removes and returns the process at the front of CPU `id`'s run queue, without running it.
	fn dequeue(&self, id: usize) -> Option<Box<Process>>;
	/// Removes and returns the next process CPU `id` should run.
	fn pick_next(&self, id: usize) -> Option<Box<Process>>;
	/// Returns a preempted-but-still-runnable process to CPU `id`'s run queue.
	fn put_prev(&self, id: usize, prev: Box<Process>);
	/// Called from [`sched_resched`] for the process CPU `id` is about to evaluate, if any.
	///
	/// Implementations that observe `curr` is no longer runnable must request a reschedule.
	fn update_curr(&self, id: usize, curr: Option<&mut Process>);
	/// Called on every timer tick for CPU `id`. May request a reschedule.
	fn tick(&self, id: usize);
	/// Chooses which CPU a newly-enqueued process should run on.
	fn select_cpu_for_proc(&self, proc: &Process) -> usize;
}

/// Baseline round-robin policy: one FIFO run queue per CPU, one tick per time slice.
///
/// A process runs until the next tick or until it is no longer runnable; there is no
/// per-process slice counter, since the process data model is deliberately opaque to everything
/// but the scheduler's own bookkeeping (kernel stack, saved registers, state, current CPU). A
/// one-tick slice is the simplest policy consistent with that constraint.
struct RoundRobin {
	queues: [IntSpin<RunQueue>; cpu::MAX_CPUS],
}

impl RoundRobin {
	const fn new() -> Self {
		#[allow(clippy::declare_interior_mutable_const)]
		const QUEUE: IntSpin<RunQueue> = IntSpin::new(RunQueue::new());
		Self {
			queues: [QUEUE; cpu::MAX_CPUS],
		}
	}
}

impl Policy for RoundRobin {
	fn init(&self, _id: usize) {}

	fn enqueue(&self, id: usize, proc: Box<Process>) {
		self.queues[id].lock().push_back(proc);
	}

	fn dequeue(&self, id: usize) -> Option<Box<Process>> {
		self.queues[id].lock().pop_front()
	}

	fn pick_next(&self, id: usize) -> Option<Box<Process>> {
		self.queues[id].lock().pop_front()
	}

	fn put_prev(&self, id: usize, prev: Box<Process>) {
		self.queues[id].lock().push_back(prev);
	}

	fn update_curr(&self, id: usize, curr: Option<&mut Process>) {
		if curr.is_some_and(|c| c.state() != State::Runnable) {
			request_resched(id);
		}
	}

	fn tick(&self, id: usize) {
		request_resched(id);
	}

	fn select_cpu_for_proc(&self, _proc: &Process) -> usize {
		// Least-loaded placement by queue depth. NUMA-aware placement is out of scope.
		let (others, n) = cpu::others();
		let mut best = cpu::id();
		let mut best_len = self.queues[best].lock().len;
		for &c in &others[..n] {
			let len = self.queues[c].lock().len;
			if len < best_len {
				best = c;
				best_len = len;
			}
		}
		best
	}
}

static POLICY: RoundRobin = RoundRobin::new();

/// Per-CPU scheduling state.
///
/// Mirrors the "per-CPU block" data model: current process, idle process, and the two
/// reschedule flags. Unlike the spec's statically-sized, segment-addressed block, this is a
/// plain Rust array indexed by logical CPU id, since nothing here needs to be reached from
/// assembly.
struct PerCpu {
	/// The process currently running on this CPU, or `None` before the first [`sched_resched`].
	current: IntSpin<Option<Box<Process>>>,
	/// This CPU's idle process, parked here whenever it is *not* the one running.
	idle: IntSpin<Option<Box<Process>>>,
	/// Set by [`Policy::tick`]/[`Policy::update_curr`] to request a reschedule at the next
	/// [`sched_resched`].
	resched_flag: AtomicBool,
	/// Whether [`sched_start`] has been called for this CPU yet.
	sched_running: AtomicBool,
	/// Whether [`sched_resched`] has ever switched on this CPU yet.
	ran_once: AtomicBool,
	/// Number of context switches performed on this CPU, for diagnostics.
	switches: AtomicU64,
}

impl PerCpu {
	const fn new() -> Self {
		Self {
			current: IntSpin::new(None),
			idle: IntSpin::new(None),
			resched_flag: AtomicBool::new(false),
			sched_running: AtomicBool::new(false),
			ran_once: AtomicBool::new(false),
			switches: AtomicU64::new(0),
		}
	}
}

#[allow(clippy::declare_interior_mutable_const)]
const PER_CPU_INIT: PerCpu = PerCpu::new();
static PER_CPU: [PerCpu; cpu::MAX_CPUS] = [PER_CPU_INIT; cpu::MAX_CPUS];

/// Whether the tick and resched interrupt callbacks have already been registered.
///
/// The callback table is global, not per-CPU: only the first call to [`sched_start`] (the
/// bootstrap processor's) needs to register it.
static CALLBACKS_REGISTERED: AtomicBool = AtomicBool::new(false);

/// Requests a reschedule on CPU `id` at its next [`sched_resched`].
fn request_resched(id: usize) {
	PER_CPU[id].resched_flag.store(true, Release);
}

/// Tick interrupt callback: bookkeeping only, the actual switch happens in [`sched_resched`],
/// which [`crate::int::interrupt_handler`] calls unconditionally on the way out of every
/// interrupt.
fn on_tick(_id: u32, _code: u32, _frame: &mut IntFrame, _ring: u8) -> CallbackResult {
	POLICY.tick(cpu::id());
	CallbackResult::Continue
}

/// Resched interrupt callback for [`schedule`]: nothing to do here either, see [`on_tick`].
fn on_resched(_id: u32, _code: u32, _frame: &mut IntFrame, _ring: u8) -> CallbackResult {
	CallbackResult::Continue
}

/// Prepares the calling CPU's scheduler state: its idle process and the policy's per-CPU state.
///
/// Must be called once per CPU, before [`sched_start`]. Does not start preemption.
pub fn sched_init() {
	let id = cpu::id();
	POLICY.init(id);
	let idle = Process::new_idle(switch::idle_entry).expect("cannot allocate idle process");
	*PER_CPU[id].idle.lock() = Some(idle);
	crate::println!("scheduler: cpu {id} ready");
}

/// Starts preemption on the calling CPU: registers the tick/resched interrupt callbacks (once,
/// globally) and arms this CPU's periodic LAPIC timer.
pub fn sched_start() {
	let id = cpu::id();
	if !CALLBACKS_REGISTERED.swap(true, AcqRel) {
		let callbacks: [(u8, int::Callback); 2] = [(TICK_VECTOR, on_tick), (RESCHED_VECTOR, on_resched)];
		for (vector, callback) in callbacks {
			if let Ok(Some(hook)) = int::register_callback(vector as u32, callback) {
				// Lives for the kernel's uptime; there is no scheduler shutdown path.
				core::mem::forget(hook);
			}
		}
	}
	apic::arm_periodic_timer(TICK_VECTOR, tick_initial_count());
	PER_CPU[id].sched_running.store(true, Release);
	crate::println!("scheduler: cpu {id} running (tick period {TICK_PERIOD_MS}ms)");
}

/// Estimates the LAPIC timer initial count for a [`TICK_PERIOD_MS`]-long period.
///
/// The bus frequency behind the divided LAPIC timer is not calibrated against a reference clock
/// here (that belongs to the device-driver layer this core assumes rather than owns); this uses
/// a fixed estimate for a typical few-hundred-MHz bus instead of deriving one from the PIT/HPET.
fn tick_initial_count() -> u32 {
	/// Rough bus ticks per millisecond at divide-by-16, calibrated for nothing in particular.
	const TICKS_PER_MS: u64 = 50_000;
	(TICKS_PER_MS * TICK_PERIOD_MS) as u32
}

/// Places `proc` onto the least-loaded CPU's run queue and requests a reschedule there.
///
/// The target CPU picks the new process up at its next tick or explicit [`schedule`] call; no
/// IPI is sent to force it sooner.
pub fn sched_enqueue(mut proc: Box<Process>) {
	let id = POLICY.select_cpu_for_proc(&proc);
	proc.set_cpu(id);
	POLICY.enqueue(id, proc);
	request_resched(id);
}

/// Removes and returns the process at the front of the calling CPU's run queue, without running
/// it.
pub fn sched_dequeue() -> Option<Box<Process>> {
	POLICY.dequeue(cpu::id())
}

/// Runs the policy's per-tick bookkeeping against the calling CPU's current process, if any.
///
/// Called from [`sched_resched`]; exposed separately so it can also be driven outside of a tick
/// (e.g. immediately after a process's state changes).
pub fn sched_update_curr() {
	let id = cpu::id();
	let mut current = PER_CPU[id].current.lock();
	POLICY.update_curr(id, current.as_deref_mut());
}

/// Requests a reschedule check on the calling CPU, outside of interrupt context.
///
/// Raises a software interrupt on [`RESCHED_VECTOR`]: since a process is only ever described by
/// a saved [`IntFrame`], [`sched_resched`] needs one to switch through, and the interrupt
/// trampoline is the only place that builds one.
pub fn schedule() {
	unsafe {
		asm!("int {v}", v = const RESCHED_VECTOR);
	}
}

/// Tells whether CPU `id` is currently running its idle process.
pub fn cpu_is_idle(id: usize) -> bool {
	PER_CPU[id]
		.current
		.lock()
		.as_ref()
		.map(Process::is_idle)
		.unwrap_or(true)
}

/// Called on the way out of every interrupt, with interrupts disabled, to decide whether to
/// switch to another process.
///
/// Reschedules iff: this is the first call on this CPU, the CPU is currently idle,
/// `resched_flag` is set, or the current process is no longer runnable. Otherwise returns
/// without touching `frame`.
pub fn sched_resched(frame: &mut IntFrame) {
	let id = cpu::id();
	let pc = &PER_CPU[id];
	if !pc.sched_running.load(Acquire) {
		return;
	}
	let mut current = pc.current.lock();
	if let Some(curr) = current.as_mut() {
		curr.save_from(frame);
	}
	let is_idle_running = current.as_ref().map(|c| c.is_idle()).unwrap_or(true);
	let not_runnable = current
		.as_ref()
		.map(|c| c.state() != State::Runnable)
		.unwrap_or(false);
	let first = !pc.ran_once.swap(true, AcqRel);
	let resched_requested = pc.resched_flag.swap(false, AcqRel);
	POLICY.update_curr(id, current.as_deref_mut());
	if !(first || is_idle_running || resched_requested || not_runnable) {
		return;
	}
	if let Some(mut prev) = current.take() {
		if prev.is_idle() {
			*pc.idle.lock() = Some(prev);
		} else if prev.state() == State::Runnable {
			prev.set_cpu(id);
			POLICY.put_prev(id, prev);
		}
		// Otherwise `prev` is dead: dropping it here frees its kernel stack.
	}
	let mut next = POLICY
		.pick_next(id)
		.or_else(|| pc.idle.lock().take())
		.expect("no runnable process and no idle process for this cpu");
	next.restore_into(frame);
	next.set_cpu(id);
	*current = Some(next);
	pc.switches.fetch_add(1, Relaxed);
}

#[cfg(test)]
mod test {
	use super::*;

	#[test_case]
	fn run_queue_fifo_order() {
		let a = Process::new(switch::idle_entry).unwrap();
		let b = Process::new(switch::idle_entry).unwrap();
		let mut q = RunQueue::new();
		q.push_back(a);
		q.push_back(b);
		assert_eq!(q.len, 2);
		let first = q.pop_front().unwrap();
		assert_eq!(first.cpu(), usize::MAX);
		assert_eq!(q.len, 1);
		let second = q.pop_front().unwrap();
		assert_eq!(q.len, 0);
		drop(second);
		assert!(q.pop_front().is_none());
	}

	#[test_case]
	fn idle_is_never_enqueued_by_resched() {
		let id = cpu::id();
		assert!(cpu_is_idle(id));
	}
}
