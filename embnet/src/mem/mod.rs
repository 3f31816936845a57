//! The static memory arena: size-class pools and a coalescing heap.
//!
//! Both allocators are carved out of storage handed over at initialization
//! and never grow. Allocation failure is an expected return value, not an
//! event: every caller above this layer handles it by dropping or deferring
//! the operation.
//!
//! Two flavors exist because packet processing has two allocation profiles.
//! Fixed descriptors and receive buffers come from the [`Pool`], which trades
//! internal fragmentation for constant-time, fragmentation-free operation.
//! Variable outbound payload comes from the [`Heap`], a first-fit allocator
//! with immediate coalescing of adjacent free blocks.
//!
//! [`Pool`]: struct.Pool.html
//! [`Heap`]: struct.Heap.html
mod heap;
mod pool;

pub use self::heap::Heap;
pub use self::pool::Pool;

/// A handle to an allocated block.
///
/// The handle is an offset into the arena of the allocator that produced it,
/// so it stays valid across moves of the allocator itself. It carries no
/// lifetime; misuse is caught by the owning allocator's bookkeeping in debug
/// builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block(pub(crate) u32);

/// The result type of allocator operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced by the allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No block of a fitting size class or contiguous region is available.
    ///
    /// Always recoverable: retry after other blocks have been freed.
    Exhausted,

    /// The requested size can not be represented or served by any class.
    BadSize,
}
