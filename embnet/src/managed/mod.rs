//! An assortment of non-owning containers.
//!
//! All of these containers have some option to construct them from one (or
//! more) slices of the underlying types instead of allocating resources
//! dynamically. On hosted builds with the `std` feature they can also take
//! ownership of a `Vec`, which keeps test setup short while the container
//! interface stays identical for the embedded target.
mod partial;
mod slice;

pub use self::partial::Partial;
pub use self::slice::Slice;

/// A sort of `Vec` on initialized data.
pub type List<'a, T> = Partial<Slice<'a, T>>;
