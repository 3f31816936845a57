use core::ops::{Deref, DerefMut};

/// A mutable slice of externally owned or owned data.
///
/// The borrowed variant is the one available on the embedded target: the
/// caller sets aside storage (usually a `static mut` handed out once) and the
/// container manages it. The owned variant exists for hosted builds and tests.
#[derive(Debug)]
pub enum Slice<'a, T> {
    /// A slice of externally owned data.
    Borrowed(&'a mut [T]),

    /// An owned vector.
    #[cfg(feature = "std")]
    Owned(Vec<T>),
}

impl<'a, T> Slice<'a, T> {
    /// An empty slice, useful as a default.
    pub fn empty() -> Self {
        Slice::Borrowed(&mut [])
    }

    /// View the data as a shared slice.
    pub fn as_slice(&self) -> &[T] {
        match self {
            Slice::Borrowed(slice) => slice,
            #[cfg(feature = "std")]
            Slice::Owned(vec) => vec.as_slice(),
        }
    }

    /// View the data as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        match self {
            Slice::Borrowed(slice) => slice,
            #[cfg(feature = "std")]
            Slice::Owned(vec) => vec.as_mut_slice(),
        }
    }
}

impl<'a, T> Default for Slice<'a, T> {
    fn default() -> Self {
        Slice::empty()
    }
}

impl<'a, T> From<&'a mut [T]> for Slice<'a, T> {
    fn from(slice: &'a mut [T]) -> Self {
        Slice::Borrowed(slice)
    }
}

#[cfg(feature = "std")]
impl<T> From<Vec<T>> for Slice<'_, T> {
    fn from(vec: Vec<T>) -> Self {
        Slice::Owned(vec)
    }
}

impl<T> Deref for Slice<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> DerefMut for Slice<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}

impl<T> AsRef<[T]> for Slice<'_, T> {
    fn as_ref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T> AsMut<[T]> for Slice<'_, T> {
    fn as_mut(&mut self) -> &mut [T] {
        self.as_mut_slice()
    }
}
