//! The protocol layers: address resolution, IP routing, TCP.
//!
//! Each layer is a plain struct operating on [`pbuf::Buffers`] handles. The
//! layers do not talk to the network themselves; they produce frames into the
//! router's egress queue which the [`stack`] drains to the device driver.
//!
//! [`pbuf::Buffers`]: ../pbuf/struct.Buffers.html
//! [`stack`]: ../stack/index.html
pub mod arp;
pub mod ip;
pub mod tcp;

use crate::mem;

/// The result type of layer operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors surfaced to the caller of a layer operation.
///
/// Malformed received packets are never part of this: they are dropped where
/// they are detected and only advance a counter. What remains falls into
/// retryable resource exhaustion, terminal connection conditions and
/// contract violations by the caller, which tests can tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// An allocator or a bounded queue is at capacity.
    ///
    /// Always recoverable. The operation had no effect beyond bookkeeping
    /// and may be retried after buffers have been freed, typically on the
    /// next poll.
    Exhausted,

    /// The arguments violate the calling contract, such as a zero-length
    /// write or an operation in a state that can not support it.
    Illegal,

    /// No interface routes to the requested address, or the frame exceeds
    /// the interface MTU.
    Unreachable,

    /// The connection is closed or closing and can no longer serve the
    /// operation. Terminal.
    Closed,
}

impl From<mem::Error> for Error {
    fn from(error: mem::Error) -> Error {
        match error {
            mem::Error::Exhausted => Error::Exhausted,
            mem::Error::BadSize => Error::Illegal,
        }
    }
}
