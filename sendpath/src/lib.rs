//! The sending half of a TCP stack.
//!
//! ## Table of contents
//!
//! This is also a recommended reading order but feel free to skip ahead, each chapter tries to be
//! somewhat self-contained.
//!
//! 1. [Highlights](#highlights)
//! 2. [Design](#design-and-relevant-core-concepts)
//! 3. [The wire module](wire/index.html)
//!    1. [Sequence numbers](wire/struct.SeqNumber.html)
//!    1. [Options](wire/struct.Options.html)
//! 4. [The tcp layer](layer/tcp/index.html)
//!    1. [The segment queue](layer/tcp/struct.SegmentQueue.html)
//!    1. [Window and size selection](layer/tcp/window/index.html)
//!    1. [The engine](layer/tcp/struct.Engine.html)
//! 5. [Transports](nic/index.html)
//!    1. [Loopback](nic/struct.Loopback.html)
//!    1. [Simulating loss](nic/struct.Lossy.html)
//! 6. Internals
//!    1. [The storage module](storage/index.html)
//!
//! ## Highlights
//!
//! * Zero-copy (re-)transmission, payloads are reference counted and shared with the transport.
//! * Congestion control, timers and the transport are plugged in as traits.
//! * Path MTU probing, tail loss probes, zero window probes and TSO sizing.
//!
//! ## Design and relevant core concepts
//!
//! A connection owns exactly one [`Engine`]. The engine never blocks and never spawns anything.
//! All entry points take the current time as an argument and return after having handed zero or
//! more segments to the transport. When the engine wants to be called again at a later point it
//! arms a timer through the timer collaborator, whose owner is responsible for calling
//! [`Engine::on_timer`] once the deadline has passed.
//!
//! Sending is split into a decision and an action. For each segment at the head of the write
//! queue a chain of gates (pacing, congestion window, receive window, Nagle, TSO deferral, small
//! queue backpressure) decides whether it may go out now and how much of it. Only then is the
//! segment cut to size and handed over. Nothing handed to the transport is ever retracted.
//!
//! Memory for queued segments is charged against a [`MemoryBudget`] which may be shared by many
//! connections. Running out of budget is never fatal, the caller is told to try again later.
//!
//! [`Engine`]: layer/tcp/struct.Engine.html
//! [`Engine::on_timer`]: layer/tcp/struct.Engine.html#method.on_timer
//! [`MemoryBudget`]: storage/struct.MemoryBudget.html
#![warn(missing_docs)]
#![warn(unreachable_pub)]

// tests should be able to use `std`
#![cfg_attr(all(
    not(feature = "std"),
    not(test)),
no_std)]

extern crate alloc;

#[macro_use] mod macros;
pub mod layer;
pub mod nic;
pub mod storage;
pub mod time;
pub mod wire;
