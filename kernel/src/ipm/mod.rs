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

//! Inter-Processor Messaging (IPM): the bus cores use to poke at one another.
//!
//! Every core owns a small FIFO of pending [`Message`]s, drained from a single dedicated
//! interrupt vector ([`VECTOR`]) fired through an IPI. Three things travel on the bus:
//! - [`Tag::Test`], used only by the test suite to check delivery;
//! - [`Tag::RemoteCall`], a function pointer a core asks another to run, with or without waiting
//!   for completion;
//! - [`Tag::TlbShootdown`], a range of virtual memory another core must invalidate from its TLB
//!   before the caller may proceed.
//!
//! Shootdown messages never touch the heap: the address-space manager that produces them is
//! itself sometimes on the path the heap allocator uses to grow, so routing them through
//! [`alloc`](crate::memory::malloc) would close a lock-ordering cycle (heap -> address space ->
//! IPM -> heap). They are built on the sender's stack and referenced by the queue only for the
//! sender's spin, which is why shootdowns jump the FIFO: a core about to service a page fault
//! against a half-updated page table cannot afford to wait behind unrelated traffic.
//!
//! To spin without risking a deadlock against a core that is itself waiting on us, a sender
//! re-enables interrupts while spinning on the completion counter; nothing here is ever held
//! across that wait.

use crate::{
	arch::x86::{apic, idt::IntFrame},
	cpu,
	int::{self, CallbackResult},
	memory::{vmem, VirtAddr},
	sync::IntSpin,
};
use core::sync::atomic::{AtomicUsize, Ordering::{Acquire, Release}};

/// The interrupt vector the IPM bus is delivered on.
///
/// Reuses the legacy IRQ1 slot: on any core with a working local APIC this slot is never wired to
/// the PS/2 controller, since device drivers are not part of this kernel.
pub const VECTOR: u8 = 0x21;

/// Depth of each core's pending-message queue.
const QUEUE_CAP: usize = 32;

/// The kind of a message travelling on the bus.
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum Tag {
	/// Delivery test, carries no side effect beyond acknowledging receipt.
	Test,
	/// Asks the receiver to run a function on its own stack.
	RemoteCall,
	/// Asks the receiver to invalidate a range of virtual memory from its TLB.
	TlbShootdown,
}

/// A function a remote core is asked to run, and how the caller learns it ran.
pub enum RemoteCall<'f> {
	/// Fire-and-forget unicast: heap-boxed since the caller does not wait around for it, so it
	/// must outlive the caller's stack frame. The single target frees it after running it.
	Async(alloc::boxed::Box<dyn Fn() + Send>),
	/// Fire-and-forget broadcast: every target gets its own reference-counted clone of the same
	/// payload, so the closure must also be `Sync`. The refcount starts at the number of targets;
	/// whichever target happens to drop the last clone frees the closure.
	AsyncBroadcast(alloc::sync::Arc<dyn Fn() + Send + Sync>),
	/// The caller blocks until every target has decremented `remaining` to zero, so the closure
	/// may safely borrow the caller's stack. `remaining` starts at 1 for a unicast call.
	Sync(&'f (dyn Fn() + Sync), &'f AtomicUsize),
}

/// A range of virtual memory to invalidate, and the shared counter every target decrements once
/// done.
pub struct Shootdown<'a> {
	/// Start of the range.
	pub addr: VirtAddr,
	/// Number of pages in the range.
	pub pages: usize,
	/// Remaining number of cores that have not yet acknowledged the shootdown.
	pub remaining: &'a AtomicUsize,
}

/// Message payload, tagged by [`Tag`].
pub enum Body<'a> {
	/// See [`Tag::Test`]; each receiver decrements the counter and does nothing else.
	Test(&'a AtomicUsize),
	/// See [`Tag::RemoteCall`].
	RemoteCall(RemoteCall<'a>),
	/// See [`Tag::TlbShootdown`].
	TlbShootdown(Shootdown<'a>),
}

impl Body<'_> {
	/// Returns the tag matching this payload.
	pub fn tag(&self) -> Tag {
		match self {
			Self::Test(_) => Tag::Test,
			Self::RemoteCall(_) => Tag::RemoteCall,
			Self::TlbShootdown(_) => Tag::TlbShootdown,
		}
	}
}

/// A message in flight on the bus.
///
/// Built on the sender's stack (or, for an asynchronous remote call, owning a heap box reachable
/// from the stack frame) and referenced by the target's queue through a raw pointer for as long
/// as it takes the target to drain it.
pub struct Message<'a> {
	body: Body<'a>,
}

impl<'a> Message<'a> {
	/// Wraps `body` into a message ready to be enqueued.
	pub fn new(body: Body<'a>) -> Self {
		Self {
			body,
		}
	}
}

/// A fixed-capacity double-ended queue of pending messages.
///
/// Ordinary traffic is appended at the tail (FIFO); a shootdown is pushed at the head so it is
/// drained before anything already queued.
struct Queue {
	slots: [Option<*const Message<'static>>; QUEUE_CAP],
	head: usize,
	len: usize,
}

impl Queue {
	const fn new() -> Self {
		Self {
			slots: [None; QUEUE_CAP],
			head: 0,
			len: 0,
		}
	}

	fn push_back(&mut self, msg: *const Message<'static>) {
		assert!(self.len < QUEUE_CAP, "IPM queue overflow");
		let idx = (self.head + self.len) % QUEUE_CAP;
		self.slots[idx] = Some(msg);
		self.len += 1;
	}

	fn push_front(&mut self, msg: *const Message<'static>) {
		assert!(self.len < QUEUE_CAP, "IPM queue overflow");
		self.head = (self.head + QUEUE_CAP - 1) % QUEUE_CAP;
		self.slots[self.head] = Some(msg);
		self.len += 1;
	}

	fn pop_front(&mut self) -> Option<*const Message<'static>> {
		if self.len == 0 {
			return None;
		}
		let msg = self.slots[self.head].take();
		self.head = (self.head + 1) % QUEUE_CAP;
		self.len -= 1;
		msg
	}
}

/// Per-CPU queues, indexed by logical CPU id.
static QUEUES: [IntSpin<Queue>; cpu::MAX_CPUS] = [const { IntSpin::new(Queue::new()) }; cpu::MAX_CPUS];

/// Sends `msg` to the single logical CPU `target`, ordering it according to its tag, and raises
/// an IPI so the target drains its queue promptly.
///
/// # Safety
///
/// The caller must keep `msg` (and anything it borrows) alive until the target has processed it,
/// which for [`RemoteCall::Sync`] and [`Shootdown`] means spinning on their completion signal.
unsafe fn send_to(target: usize, msg: &Message) {
	let raw = (msg as *const Message).cast::<Message<'static>>();
	{
		let mut queue = QUEUES[target].lock();
		match msg.body.tag() {
			Tag::TlbShootdown => queue.push_front(raw),
			Tag::Test | Tag::RemoteCall => queue.push_back(raw),
		}
	}
	let Some(apic_id) = cpu::apic_id_of(target) else {
		return;
	};
	unsafe {
		apic::write_reg(apic::REG_ICR_HI, (apic_id as u32) << 24);
		apic::write_reg(apic::REG_ICR_LO, VECTOR as u32);
		apic::wait_delivery();
	}
}

/// Sends `msg` to every other online core and returns how many it was sent to.
///
/// The caller must arm its completion counter to that count *before* calling this function: a
/// fast target may decrement it before [`broadcast`] returns.
///
/// # Safety
///
/// Same contract as [`send_to`], for every target the message reaches.
unsafe fn broadcast(msg: &Message) -> usize {
	let (targets, n) = cpu::others();
	for &target in &targets[..n] {
		unsafe {
			send_to(target, msg);
		}
	}
	n
}

/// Returns the number of other online cores, without sending anything.
fn others_count() -> usize {
	cpu::others().1
}

/// Spins until `done` is set, keeping interrupts enabled so this core can still service the
/// shootdowns and remote calls of cores that are themselves waiting on us.
///
/// Sends an end-of-interrupt first, in case the caller is itself a [`RemoteCall`] handler still
/// running inside [`drain`]: without it, the local APIC's in-service bit for [`VECTOR`] would
/// keep a shootdown sent to us by whoever we're now waiting on pending instead of delivered,
/// which is exactly the ordering [`Tag::TlbShootdown`] jumping the queue is meant to avoid.
fn spin_until(done: impl Fn() -> bool) {
	use crate::arch::x86::{sti, is_interrupt_enabled};
	apic::end_of_interrupt();
	let was_enabled = is_interrupt_enabled();
	sti();
	while !done() {
		core::hint::spin_loop();
	}
	if !was_enabled {
		crate::arch::x86::cli();
	}
}

/// Sends a delivery-test message to `target` and waits for it to be acknowledged.
pub fn send_ipm(target: usize) {
	let remaining = AtomicUsize::new(1);
	let msg = Message::new(Body::Test(&remaining));
	unsafe {
		send_to(target, &msg);
	}
	spin_until(|| remaining.load(Acquire) == 0);
}

/// Broadcasts a delivery-test message to every other core and waits for all acknowledgements.
pub fn broadcast_ipm() {
	let remaining = AtomicUsize::new(others_count());
	let msg = Message::new(Body::Test(&remaining));
	unsafe {
		broadcast(&msg);
	}
	spin_until(|| remaining.load(Acquire) == 0);
}

/// Runs `f` on core `target`, blocking until it has run.
pub fn exec_remote_call(target: usize, f: &(dyn Fn() + Sync)) {
	let remaining = AtomicUsize::new(1);
	let msg = Message::new(Body::RemoteCall(RemoteCall::Sync(f, &remaining)));
	unsafe {
		send_to(target, &msg);
	}
	spin_until(|| remaining.load(Acquire) == 0);
}

/// Runs `f` on every other core, blocking until all of them have run it.
pub fn broadcast_remote_call(f: &(dyn Fn() + Sync)) {
	let n = others_count();
	if n == 0 {
		return;
	}
	let remaining = AtomicUsize::new(n);
	let msg = Message::new(Body::RemoteCall(RemoteCall::Sync(f, &remaining)));
	unsafe {
		broadcast(&msg);
	}
	spin_until(|| remaining.load(Acquire) == 0);
}

/// Asks core `target` to run `f` without waiting for it to complete.
///
/// # Errors
///
/// Returns an error if the closure cannot be boxed.
pub fn exec_remote_call_async(
	target: usize,
	f: impl Fn() + Send + 'static,
) -> utils::errno::AllocResult<()> {
	use alloc::boxed::Box;
	let boxed: Box<dyn Fn() + Send> = Box::try_new(f).map_err(|_| utils::errno::AllocError)?;
	let msg = Message::new(Body::RemoteCall(RemoteCall::Async(boxed)));
	// The message itself is stack-local, but its payload is heap-owned and leaked into the queue:
	// the receiver drops the box after running it.
	let leaked = alloc::boxed::Box::new(msg);
	let raw = alloc::boxed::Box::into_raw(leaked);
	unsafe {
		let mut queue = QUEUES[target].lock();
		queue.push_back(raw);
	}
	let Some(apic_id) = cpu::apic_id_of(target) else {
		return Ok(());
	};
	unsafe {
		apic::write_reg(apic::REG_ICR_HI, (apic_id as u32) << 24);
		apic::write_reg(apic::REG_ICR_LO, VECTOR as u32);
		apic::wait_delivery();
	}
	Ok(())
}

/// Asks every other online core to run `f` without waiting for any of them to complete.
///
/// Per the bus's non-waiting broadcast policy, the payload is shared by reference count rather
/// than copied once per target: it starts at one clone per target, and whichever target happens
/// to drop the last one frees the closure.
///
/// # Errors
///
/// Returns an error if the closure cannot be allocated. If no other core is online, this is a
/// no-op that always succeeds.
pub fn broadcast_remote_call_async(
	f: impl Fn() + Send + Sync + 'static,
) -> utils::errno::AllocResult<()> {
	use alloc::{boxed::Box, sync::Arc};
	let (targets, n) = cpu::others();
	if n == 0 {
		return Ok(());
	}
	let shared: Arc<dyn Fn() + Send + Sync> =
		Arc::try_new(f).map_err(|_| utils::errno::AllocError)?;
	for &target in &targets[..n] {
		let msg = Message::new(Body::RemoteCall(RemoteCall::AsyncBroadcast(shared.clone())));
		// As in `exec_remote_call_async`, the message itself is leaked into the queue; the
		// receiver frees it (and so drops its `Arc` clone) after running the payload.
		let leaked = Box::new(msg);
		let raw = Box::into_raw(leaked);
		unsafe {
			let mut queue = QUEUES[target].lock();
			queue.push_back(raw);
		}
		let Some(apic_id) = cpu::apic_id_of(target) else {
			continue;
		};
		unsafe {
			apic::write_reg(apic::REG_ICR_HI, (apic_id as u32) << 24);
			apic::write_reg(apic::REG_ICR_LO, VECTOR as u32);
			apic::wait_delivery();
		}
	}
	Ok(())
}

/// Invalidates `pages` pages of virtual memory starting at `addr` on every other core, blocking
/// until all of them have acknowledged the shootdown.
///
/// Called by [`vmem`] after an address space shared across cores (the kernel's, or a process'
/// currently scheduled on more than one core) loses or downgrades a mapping.
pub fn exec_tlb_shootdown(addr: VirtAddr, pages: usize) {
	let n = others_count();
	if n == 0 {
		return;
	}
	let remaining = AtomicUsize::new(n);
	let shootdown = Shootdown {
		addr,
		pages,
		remaining: &remaining,
	};
	let msg = Message::new(Body::TlbShootdown(shootdown));
	unsafe {
		broadcast(&msg);
	}
	spin_until(|| remaining.load(Acquire) == 0);
}

/// Runs a remote-call payload with interrupts re-enabled, restoring the previous interrupt-enable
/// state before returning.
///
/// A target that needs to receive an IPM of its own while running the payload - most critically
/// another TLB shootdown - must not have interrupts disabled for the duration, or the two cores
/// deadlock on each other.
fn with_interrupts_enabled<R>(f: impl FnOnce() -> R) -> R {
	use crate::arch::x86::{sti, cli, is_interrupt_enabled};
	let was_enabled = is_interrupt_enabled();
	sti();
	let ret = f();
	if !was_enabled {
		cli();
	}
	ret
}

/// Drains and executes every message pending on the calling core's queue.
fn drain() {
	let me = cpu::id();
	loop {
		let raw = {
			let mut queue = QUEUES[me].lock();
			queue.pop_front()
		};
		let Some(raw) = raw else {
			break;
		};
		// SAFETY: the sender keeps the pointee alive until its completion signal is observed, or
		// (for an async remote call) until we free it below.
		let msg = unsafe { &*raw };
		match &msg.body {
			Body::Test(remaining) => {
				remaining.fetch_sub(1, Release);
			}
			Body::RemoteCall(RemoteCall::Sync(f, remaining)) => {
				with_interrupts_enabled(|| f());
				remaining.fetch_sub(1, Release);
			}
			Body::RemoteCall(RemoteCall::Async(f)) => {
				with_interrupts_enabled(|| f());
				// The sender never waits on this one; we own the box and must free it.
				drop(unsafe { alloc::boxed::Box::from_raw(raw.cast_mut()) });
				continue;
			}
			Body::RemoteCall(RemoteCall::AsyncBroadcast(f)) => {
				with_interrupts_enabled(|| f());
				// We own this target's Message (and the Arc clone inside it); freeing it drops
				// our clone, releasing the closure once every target has done the same.
				drop(unsafe { alloc::boxed::Box::from_raw(raw.cast_mut()) });
				continue;
			}
			Body::TlbShootdown(shootdown) => {
				for i in 0..shootdown.pages {
					vmem::invalidate_page(shootdown.addr + i * crate::memory::PAGE_SIZE);
				}
				shootdown.remaining.fetch_sub(1, Release);
			}
		}
	}
}

/// Interrupt entry point for the IPM vector.
fn on_interrupt(_id: u32, _code: u32, _frame: &mut IntFrame, _ring: u8) -> CallbackResult {
	drain();
	CallbackResult::Continue
}

/// Registers the IPM interrupt handler. Must run once at boot, after the interrupt descriptor
/// table is in place.
pub fn init() {
	let hook = int::register_callback(VECTOR as u32, on_interrupt)
		.expect("failed to register the IPM interrupt handler")
		.expect("invalid IPM interrupt vector");
	// The handler lives for the whole uptime of the kernel; never unregister it.
	core::mem::forget(hook);
}

#[cfg(test)]
mod test {
	use super::*;

	// Self-tests run on a single registered core (the BSP, right after `cpu::register` in
	// `kernel.rs`, before any AP is brought up), so nothing here can exercise an actual IPI round
	// trip: `cpu::others()` is always empty. What's left to check without a second core is the
	// queue's ordering discipline and that every broadcast entry point degrades to a no-op
	// instead of spinning forever when there is no one to answer it.

	#[test_case]
	fn queue_fifo_order() {
		let a = 1usize as *const Message<'static>;
		let b = 2usize as *const Message<'static>;
		let c = 3usize as *const Message<'static>;
		let mut q = Queue::new();
		q.push_back(a);
		q.push_back(b);
		q.push_back(c);
		assert_eq!(q.pop_front(), Some(a));
		assert_eq!(q.pop_front(), Some(b));
		assert_eq!(q.pop_front(), Some(c));
		assert_eq!(q.pop_front(), None);
	}

	#[test_case]
	fn queue_shootdown_jumps_the_line() {
		let a = 1usize as *const Message<'static>;
		let b = 2usize as *const Message<'static>;
		let shootdown = 9usize as *const Message<'static>;
		let mut q = Queue::new();
		q.push_back(a);
		q.push_back(b);
		// A shootdown arriving after ordinary traffic still drains first.
		q.push_front(shootdown);
		assert_eq!(q.pop_front(), Some(shootdown));
		assert_eq!(q.pop_front(), Some(a));
		assert_eq!(q.pop_front(), Some(b));
	}

	#[test_case]
	fn queue_wraps_around_capacity() {
		let mut q = Queue::new();
		// Fill, drain a few from the front, then push more: exercises the modular indexing in
		// both push_back and push_front once `head` has moved away from 0.
		for i in 0..QUEUE_CAP {
			q.push_back((i + 1) as *const Message<'static>);
		}
		for i in 0..QUEUE_CAP / 2 {
			assert_eq!(q.pop_front(), Some((i + 1) as *const Message<'static>));
		}
		for i in 0..QUEUE_CAP / 2 {
			q.push_back((QUEUE_CAP + i + 1) as *const Message<'static>);
		}
		for i in QUEUE_CAP / 2..QUEUE_CAP + QUEUE_CAP / 2 {
			assert_eq!(q.pop_front(), Some((i + 1) as *const Message<'static>));
		}
		assert_eq!(q.pop_front(), None);
	}

	#[test_case]
	fn broadcast_ipm_is_noop_with_no_other_cpus() {
		// A single online core has nobody to wait on: `remaining` is armed at 0 and the spin
		// condition is already true, so this returns instead of hanging.
		broadcast_ipm();
	}

	#[test_case]
	fn broadcast_remote_call_is_noop_with_no_other_cpus() {
		let ran = AtomicUsize::new(0);
		broadcast_remote_call(&|| {
			ran.fetch_add(1, Release);
		});
		// Nothing was online to run it.
		assert_eq!(ran.load(Acquire), 0);
	}

	#[test_case]
	fn broadcast_remote_call_async_is_noop_with_no_other_cpus() {
		// Nothing to allocate for and nobody to send to: must return Ok without touching the
		// refcounted payload at all.
		broadcast_remote_call_async(|| {}).unwrap();
	}

	#[test_case]
	fn tlb_shootdown_is_noop_with_no_other_cpus() {
		exec_tlb_shootdown(VirtAddr(0x1000), 1);
	}
}
