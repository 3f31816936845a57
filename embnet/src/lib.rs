//! An embedded TCP/IP protocol core.
//!
//! This crate is the protocol engine of a small network stack for
//! resource-constrained, network-attached devices: a microcontroller driving a
//! companion radio or Ethernet chip. There is no operating system underneath.
//! Memory is a fixed arena handed over at initialization, concurrency is
//! cooperative, and every allocation is bounded and reclaimable.
//!
//! ## Table of contents
//!
//! 1. [The mem module](mem/index.html) — size-class pools and a coalescing heap
//! 2. [The pbuf module](pbuf/index.html) — reference-counted, chainable packet buffers
//! 3. [The wire module](wire/index.html) — bit-exact header codecs
//! 4. [The layers](layer/index.html) — ARP cache, IP router, TCP engine
//! 5. [The stack](stack/index.html) — the top-level context and driver boundary
//!
//! ## Design and relevant core concepts
//!
//! Nothing within `embnet` *ever* dynamically allocates memory on its own and
//! there is no arbitrary recursion. Setup code passes in preallocated storage
//! to use instead of it being a runtime choice. Where connections compete for a
//! resource the partitioning happens up front: pools have fixed size classes,
//! the packet buffer slab has a fixed slot count, every queue has a configured
//! depth.
//!
//! All protocol processing runs on one logical worker driven by an external
//! polling loop. No call blocks; waiting for an ARP resolution, a
//! retransmission timeout or window growth is state held in a data structure
//! and progressed by the next call into the engine. Allocation failure is a
//! normal return value everywhere: a send is deferred, a received packet is
//! dropped, a counter advances. It is never fatal.
#![warn(missing_docs)]
#![warn(unreachable_pub)]

// tests should be able to use `std`
#![cfg_attr(all(
    not(feature = "std"),
    not(test)),
no_std)]

#[macro_use] mod macros;
pub mod config;
pub mod layer;
pub mod managed;
pub mod mem;
pub mod pbuf;
pub mod stack;
pub mod time;
pub mod wire;

pub use self::config::Config;
pub use self::stack::{Device, Stack};
