#![allow(unsafe_code)]
//! Tagged opaque handles over native pointers.
//!
//! A [`Capsule`] carries exactly one native pointer, a tag string naming
//! the resource family, and a destructor. The tag check is the only type
//! information that survives the FFI boundary, so every extraction
//! requires the expected tag and mismatches are typed errors — never
//! undefined behavior.
//!
//! Host objects expose their capsule through [`Bound`]; [`native_of`]
//! runs the full discovery protocol and produces three distinct errors:
//! no binding present, wrong tag, and already-consumed native pointer.

use std::ffi::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{Error, Result};

/// Destructor invoked with the capsule's native pointer when the capsule
/// is dropped or explicitly consumed.
pub type CapsuleDtor = unsafe fn(*mut c_void);

/// An opaque, typed wrapper over one native pointer.
///
/// The capsule exclusively owns its pointer; sharing one native pointer
/// across capsules is forbidden.
pub struct Capsule {
    tag: &'static str,
    ptr: AtomicPtr<c_void>,
    dtor: Option<CapsuleDtor>,
}

impl std::fmt::Debug for Capsule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capsule")
            .field("tag", &self.tag)
            .field("consumed", &self.ptr.load(Ordering::Acquire).is_null())
            .finish()
    }
}

// The capsule is a plain pointer box; thread discipline for the pointee
// is the owning subsystem's contract, as with any foreign handle.
unsafe impl Send for Capsule {}
unsafe impl Sync for Capsule {}

impl Capsule {
    /// Wrap `ptr` under `tag`.
    ///
    /// # Errors
    /// [`Error::NullPointer`] if `ptr` is null.
    ///
    /// # Safety
    /// `ptr` must be exclusively owned by this capsule and remain valid
    /// until the destructor runs.
    pub unsafe fn wrap(
        ptr: *mut c_void,
        tag: &'static str,
        dtor: Option<CapsuleDtor>,
    ) -> Result<Self> {
        if ptr.is_null() {
            return Err(Error::NullPointer);
        }
        Ok(Self {
            tag,
            ptr: AtomicPtr::new(ptr),
            dtor,
        })
    }

    /// The resource-family tag.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Borrow the native pointer, checking the tag.
    ///
    /// # Errors
    /// [`Error::TagMismatch`] if `tag` differs; [`Error::NullNative`] if
    /// the pointer was already consumed.
    pub fn claim<T>(&self, tag: &'static str) -> Result<*mut T> {
        if self.tag != tag {
            return Err(Error::TagMismatch {
                expected: tag,
                found: self.tag,
            });
        }
        let ptr = self.ptr.load(Ordering::Acquire);
        if ptr.is_null() {
            return Err(Error::NullNative(self.tag));
        }
        Ok(ptr.cast())
    }

    /// Extract the native pointer and leave the capsule consumed; the
    /// destructor will not run. Used by explicit close paths that take
    /// over the pointer's release.
    ///
    /// # Errors
    /// Same as [`claim`](Self::claim).
    pub fn take<T>(&self, tag: &'static str) -> Result<*mut T> {
        if self.tag != tag {
            return Err(Error::TagMismatch {
                expected: tag,
                found: self.tag,
            });
        }
        let ptr = self.ptr.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if ptr.is_null() {
            return Err(Error::NullNative(self.tag));
        }
        Ok(ptr.cast())
    }

    /// Whether the native pointer has been consumed.
    #[must_use]
    pub fn is_consumed(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }
}

impl Drop for Capsule {
    fn drop(&mut self) {
        let ptr = self.ptr.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if !ptr.is_null() {
            if let Some(dtor) = self.dtor {
                unsafe { dtor(ptr) };
            }
        }
    }
}

/// A host object that may carry a native binding.
pub trait Bound {
    /// The capsule, if the object is currently bound.
    fn binding(&self) -> Option<&Capsule>;
}

/// Resource discovery: find `obj`'s capsule, require `tag`, and borrow
/// the native pointer.
///
/// # Errors
/// [`Error::NotBound`] when the object has no capsule,
/// [`Error::TagMismatch`] for a foreign capsule, [`Error::NullNative`]
/// for a consumed one.
pub fn native_of<T, B: Bound + ?Sized>(obj: &B, tag: &'static str) -> Result<*mut T> {
    let capsule = obj
        .binding()
        .ok_or(Error::NotBound(std::any::type_name::<B>()))?;
    capsule.claim(tag)
}
