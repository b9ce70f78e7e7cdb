//! Core runtime of a monolithic x86-64 kernel: physical frame allocator,
//! page-table walker, virtual memory manager, slab heap, and a per-CPU
//! scheduler.
//!
//! This crate has no boot entry point and no panic handler of its own — both
//! belong to the boot shim, the external collaborator that links against
//! `platform::init`/`platform::on_timer_tick`/`platform::on_page_fault` and
//! owns every `#[panic_handler]`/`_start` decision for the binary it
//! produces, keeping those lang items out of this crate and in the boot
//! crate instead.

// `cargo test` runs the per-module `#[cfg(test)]` suites on the host with
// the ordinary std test harness, so `no_std` itself is gated off in that
// configuration; the crate that ships to the target still builds `no_std`
// (nothing below reaches for std outside `#[cfg(test)]` blocks).
#![cfg_attr(not(test), no_std)]
#![feature(alloc_error_handler)]

extern crate alloc;

pub mod error;
pub mod log;
pub mod memory;
pub mod platform;
pub mod sched;
