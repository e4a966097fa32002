//! Ownership-qualified wrapper for externally ref-counted handles.
//!
//! The C-style front end hands out raw handles whose lifetime is managed by
//! an external reference count. [`OwnedHandle`] pins down who owns a count:
//! [`OwnedHandle::retain`] takes a new reference (incrementing), while
//! [`OwnedHandle::adopt`] assumes ownership of an existing reference without
//! incrementing. Dropping the wrapper releases its reference; [`into_raw`]
//! hands the reference back out without releasing.
//!
//! [`into_raw`]: OwnedHandle::into_raw

/// A raw handle with an external reference count.
pub trait ExternalHandle: Copy + Eq {
    /// The null handle value.
    const NULL: Self;

    /// Increment the handle's reference count.
    ///
    /// # Safety
    ///
    /// The handle must be live (count > 0) and non-null.
    unsafe fn reference(self);

    /// Decrement the handle's reference count, destroying the underlying
    /// object when it reaches zero.
    ///
    /// # Safety
    ///
    /// The caller must own a reference to the handle.
    unsafe fn release(self);
}

/// RAII wrapper owning exactly one reference to an [`ExternalHandle`].
///
/// A null wrapper owns nothing and is inert.
#[derive(Debug)]
pub struct OwnedHandle<T: ExternalHandle> {
    raw: T,
}

impl<T: ExternalHandle> OwnedHandle<T> {
    /// Wrap a handle by taking a new reference to it.
    ///
    /// # Safety
    ///
    /// `raw` must be live if non-null.
    pub unsafe fn retain(raw: T) -> Self {
        if raw != T::NULL {
            unsafe { raw.reference() };
        }
        Self { raw }
    }

    /// Wrap a handle by assuming ownership of an existing reference.
    ///
    /// The count is not incremented; the caller's reference is consumed.
    ///
    /// # Safety
    ///
    /// The caller must own a reference to `raw` if non-null.
    pub unsafe fn adopt(raw: T) -> Self {
        Self { raw }
    }

    /// The wrapped raw handle.
    pub fn get(&self) -> T {
        self.raw
    }

    /// Whether this wrapper holds a non-null handle.
    pub fn is_valid(&self) -> bool {
        self.raw != T::NULL
    }

    /// Give up ownership of the reference and return the raw handle.
    ///
    /// The count is not decremented; the caller now owns the reference.
    pub fn into_raw(mut self) -> T {
        std::mem::replace(&mut self.raw, T::NULL)
    }
}

impl<T: ExternalHandle> Default for OwnedHandle<T> {
    fn default() -> Self {
        Self { raw: T::NULL }
    }
}

impl<T: ExternalHandle> Clone for OwnedHandle<T> {
    fn clone(&self) -> Self {
        // A live wrapper implies a live handle, so retaining is in contract.
        unsafe { Self::retain(self.raw) }
    }
}

impl<T: ExternalHandle> Drop for OwnedHandle<T> {
    fn drop(&mut self) {
        if self.raw != T::NULL {
            unsafe { self.raw.release() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Counted(*mut i32);

    impl ExternalHandle for Counted {
        const NULL: Self = Counted(std::ptr::null_mut());

        unsafe fn reference(self) {
            unsafe {
                assert!(*self.0 > 0);
                *self.0 += 1;
            }
        }

        unsafe fn release(self) {
            unsafe {
                assert!(*self.0 > 0);
                *self.0 -= 1;
            }
        }
    }

    #[test]
    fn test_retain_takes_and_drops_a_reference() {
        let mut count = 1;
        {
            let handle = unsafe { OwnedHandle::retain(Counted(&mut count)) };
            assert!(handle.is_valid());
            assert_eq!(count, 2);
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn test_adopt_consumes_callers_reference() {
        let mut count = 1;
        {
            let _handle = unsafe { OwnedHandle::adopt(Counted(&mut count)) };
            assert_eq!(count, 1);
        }
        assert_eq!(count, 0);
    }

    #[test]
    fn test_clone_takes_a_new_reference() {
        let mut count = 1;
        {
            let first = unsafe { OwnedHandle::retain(Counted(&mut count)) };
            let second = first.clone();
            assert_eq!(count, 3);
            assert_eq!(first.get(), second.get());
        }
        assert_eq!(count, 1);
    }

    #[test]
    fn test_into_raw_keeps_the_reference() {
        let mut count = 1;
        let raw = Counted(&mut count);
        {
            let handle = unsafe { OwnedHandle::retain(raw) };
            assert_eq!(count, 2);
            assert_eq!(handle.into_raw(), raw);
        }
        // into_raw transferred the reference out, so nothing was released.
        assert_eq!(count, 2);
    }

    #[test]
    fn test_null_wrapper_is_inert() {
        let handle: OwnedHandle<Counted> = OwnedHandle::default();
        assert!(!handle.is_valid());
        drop(handle.clone());
    }
}
