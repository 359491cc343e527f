// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-relative typed pointer.
//!
//! An [`OffsetPtr`] stores the signed byte distance from its own address to
//! its target instead of an absolute address. A region full of such pointers
//! stays coherent when another process maps it at a different base address.
//!
//! Null is encoded as the reserved offset `+1`: a pointer to itself would be
//! offset `0`, and any other in-region target lies at least one 8-byte
//! allocation unit away, so offset `1` can never be a legitimate reference.
//!
//! A non-null `OffsetPtr` is only meaningful at the address where it was
//! assigned. It therefore implements neither `Copy` nor `Clone`; a value is
//! transferred by reading the target with [`get`](OffsetPtr::get) and storing
//! it into the destination with [`set`](OffsetPtr::set). Container code that
//! must relocate raw bytes uses [`crate::vec::Relocate`] for the same reason.

use core::fmt;
use core::marker::PhantomData;
use core::ptr;

const NULL_OFFSET: isize = 1;

#[repr(transparent)]
pub struct OffsetPtr<T> {
    offset: isize,
    _marker: PhantomData<*mut T>,
}

// SAFETY: the pointee lives in a shared region; access to it is serialized by
// the region's locks, never by this type.
unsafe impl<T> Send for OffsetPtr<T> {}
unsafe impl<T> Sync for OffsetPtr<T> {}

impl<T> OffsetPtr<T> {
    /// A null pointer. The only `OffsetPtr` value that may be moved freely.
    pub const fn null() -> Self {
        OffsetPtr {
            offset: NULL_OFFSET,
            _marker: PhantomData,
        }
    }

    #[inline]
    fn base(&self) -> isize {
        self as *const Self as isize
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.offset == NULL_OFFSET
    }

    /// Resolves the target address, or a null raw pointer.
    #[inline]
    pub fn get(&self) -> *mut T {
        if self.offset == NULL_OFFSET {
            return ptr::null_mut();
        }
        (self.base() + self.offset) as *mut T
    }

    /// Re-derives the stored offset for the given target.
    #[inline]
    pub fn set(&mut self, target: *const T) {
        if target.is_null() {
            self.offset = NULL_OFFSET;
        } else {
            self.offset = target as isize - self.base();
        }
    }

    /// Copies by value-of-target: `self` ends up referring to the same object
    /// as `other`, regardless of where the two pointers themselves live.
    #[inline]
    pub fn set_from(&mut self, other: &OffsetPtr<T>) {
        self.set(other.get());
    }

    /// Moves the target by `count` elements, like raw pointer `offset`.
    #[inline]
    pub fn advance(&mut self, count: isize) {
        let p = self.get();
        debug_assert!(!p.is_null());
        self.set(p.wrapping_offset(count));
    }

    /// Element distance to another pointer's target.
    #[inline]
    pub fn distance_from(&self, other: &OffsetPtr<T>) -> isize {
        let a = self.get() as isize;
        let b = other.get() as isize;
        (a - b) / core::mem::size_of::<T>() as isize
    }

    /// # Safety
    /// The target must be live and no mutable reference to it may exist.
    #[inline]
    pub unsafe fn as_ref<'a>(&self) -> Option<&'a T> {
        self.get().as_ref()
    }

    /// # Safety
    /// The target must be live and no other reference to it may exist.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut<'a>(&self) -> Option<&'a mut T> {
        self.get().as_mut()
    }
}

impl<T> PartialEq for OffsetPtr<T> {
    /// Equality is by target, not by stored offset.
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl<T> Eq for OffsetPtr<T> {}

impl<T> fmt::Debug for OffsetPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OffsetPtr({:p})", self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Pin a value and a pointer next to each other so offsets stay valid for
    // the lifetime of the test.
    struct Fixture {
        values: [i32; 4],
        ptr: OffsetPtr<i32>,
    }

    #[test]
    fn null_roundtrip() {
        let p: OffsetPtr<i32> = OffsetPtr::null();
        assert!(p.is_null());
        assert!(p.get().is_null());
    }

    #[test]
    fn basic() {
        let mut fx = Fixture {
            values: [42, 43, 44, 45],
            ptr: OffsetPtr::null(),
        };
        let base = fx.values.as_ptr();
        fx.ptr.set(base);
        assert!(!fx.ptr.is_null());
        assert_eq!(fx.ptr.get(), base as *mut i32);
        assert_eq!(unsafe { *fx.ptr.get() }, 42);

        fx.ptr.set(ptr::null());
        assert!(fx.ptr.is_null());
        fx.ptr.set(base);
        assert_eq!(fx.ptr.get(), base as *mut i32);
    }

    #[test]
    fn arithmetic() {
        let mut fx = Fixture {
            values: [1, 2, 3, 4],
            ptr: OffsetPtr::null(),
        };
        let base = fx.values.as_ptr();
        fx.ptr.set(base);
        fx.ptr.advance(1);
        assert_eq!(unsafe { *fx.ptr.get() }, 2);
        fx.ptr.advance(-1);
        assert_eq!(unsafe { *fx.ptr.get() }, 1);

        let mut other = Fixture {
            values: [0; 4],
            ptr: OffsetPtr::null(),
        };
        other.ptr.set(unsafe { base.add(3) });
        // distance is measured between targets, which here sit in fx.values
        let mut third = OffsetPtr::null();
        third.set(base);
        assert_eq!(other.ptr.distance_from(&third), 3);
    }

    #[test]
    fn equality_is_by_target() {
        let fx = Fixture {
            values: [7; 4],
            ptr: OffsetPtr::null(),
        };
        let mut a = OffsetPtr::null();
        let mut b = OffsetPtr::null();
        a.set(fx.values.as_ptr());
        b.set(fx.values.as_ptr());
        // a and b live at different addresses, so their raw offsets differ
        assert_eq!(a, b);
        b.set(unsafe { fx.values.as_ptr().add(1) });
        assert_ne!(a, b);
    }

    #[test]
    fn survives_region_remap() {
        // Simulate remapping: build a tiny "region" where an OffsetPtr refers
        // to a sibling slot, copy the bytes somewhere else, and observe the
        // pointer resolving to the sibling in the copy.
        #[repr(C)]
        struct Region {
            target: u64,
            link: OffsetPtr<u64>,
        }
        let mut a = Region {
            target: 0xdead,
            link: OffsetPtr::null(),
        };
        let target_ptr = &a.target as *const u64;
        a.link.set(target_ptr);
        assert_eq!(unsafe { *a.link.get() }, 0xdead);

        let mut b = Region {
            target: 0,
            link: OffsetPtr::null(),
        };
        // bitwise snapshot, as mmap at a new base would produce
        unsafe {
            ptr::copy_nonoverlapping(
                &a as *const Region as *const u8,
                &mut b as *mut Region as *mut u8,
                core::mem::size_of::<Region>(),
            );
        }
        b.target = 0xbeef;
        assert_eq!(b.link.get(), &b.target as *const u64 as *mut u64);
        assert_eq!(unsafe { *b.link.get() }, 0xbeef);
    }
}
