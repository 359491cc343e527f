// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Type-erased field slots.
//!
//! A [`Field`] is the pair of a type hash and an [`OffsetPtr`] to the value,
//! and is exactly 16 bytes. `type_hash == 0` iff the data pointer is null iff
//! the field is empty. All behavior is dispatched through the registry in
//! [`typing`](crate::typing).
//!
//! Managed fields own their data; clearing them before they are discarded is
//! the owner's responsibility, and dropping a still-initialized field is a
//! programmer error that panics rather than leaking region memory silently.

use crate::error::{Error, Result};
use crate::typing::{get_type, get_type_name, type_hash, FieldType};
use core::fmt;
use core::fmt::Write as _;
use core::mem;
use core::ptr;
use core::ptr::NonNull;
use libdd_structstore_alloc::{OffsetPtr, ReadGuard, Relocate, SharedAlloc, SpinMutex, WriteGuard};
use tracing::debug;

/// Common header embedded in every composite field type: the owner
/// back-reference used by the invariant audit, and the per-field lock.
#[repr(C)]
pub struct FieldBase {
    parent: OffsetPtr<FieldBase>,
    mutex: SpinMutex,
}

impl FieldBase {
    /// # Safety
    /// `this` points to uninitialized memory inside the value being
    /// constructed.
    pub(crate) unsafe fn init(this: *mut FieldBase, parent: Option<NonNull<FieldBase>>) {
        ptr::write(ptr::addr_of_mut!((*this).parent), OffsetPtr::null());
        if let Some(p) = parent {
            (*this).parent.set(p.as_ptr());
        }
        ptr::write(ptr::addr_of_mut!((*this).mutex), SpinMutex::new());
    }

    pub(crate) fn set_parent(&mut self, parent: Option<NonNull<FieldBase>>) {
        match parent {
            Some(p) => self.parent.set(p.as_ptr()),
            None => self.parent.set(ptr::null()),
        }
    }

    pub(crate) fn parent_matches(&self, parent: Option<NonNull<FieldBase>>) -> bool {
        self.parent.get() == parent.map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Scoped shared lock on this field.
    pub fn read_lock(&self) -> Result<ReadGuard<'_>> {
        Ok(self.mutex.read_lock()?)
    }

    /// Scoped exclusive lock on this field.
    pub fn write_lock(&self) -> WriteGuard<'_> {
        self.mutex.write_lock()
    }
}

#[repr(C)]
pub struct Field {
    type_hash: u64,
    data: OffsetPtr<u8>,
}

const _: () = assert!(mem::size_of::<Field>() == 16);

impl Field {
    /// An empty slot; safe to move until it is constructed.
    pub const fn empty() -> Field {
        Field {
            type_hash: 0,
            data: OffsetPtr::null(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_null()
    }

    #[inline]
    pub fn type_hash(&self) -> u64 {
        self.type_hash
    }

    /// Binds this slot to externally owned storage; used by unmanaged maps.
    pub(crate) fn init_unmanaged<T: FieldType>(&mut self, value: NonNull<T>) {
        debug_assert!(self.is_empty());
        self.type_hash = type_hash(T::NAME);
        self.data.set(value.as_ptr() as *const u8);
    }

    /// Typed shared access. Fails with [`Error::TypeMismatch`] when the slot
    /// is empty or holds another type.
    pub fn get_ref<T: FieldType>(&self) -> Result<&T> {
        let expected = type_hash(T::NAME);
        if self.data.is_null() || self.type_hash != expected {
            return Err(Error::TypeMismatch {
                expected,
                actual: self.type_hash,
            });
        }
        Ok(unsafe { &*(self.data.get() as *const T) })
    }

    /// Typed exclusive access.
    pub fn get_mut<T: FieldType>(&mut self) -> Result<&mut T> {
        let expected = type_hash(T::NAME);
        if self.data.is_null() || self.type_hash != expected {
            return Err(Error::TypeMismatch {
                expected,
                actual: self.type_hash,
            });
        }
        Ok(unsafe { &mut *(self.data.get() as *mut T) })
    }

    /// Returns the existing value of type `T`, constructing a default one in
    /// place when the slot is empty.
    pub fn get_or_construct<T: FieldType>(
        &mut self,
        alloc: &SharedAlloc,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<&mut T> {
        if self.is_empty() {
            self.construct_by_hash(alloc, type_hash(T::NAME), parent)?;
        }
        self.get_mut::<T>()
    }

    /// Allocates and default-constructs a value of the registered type
    /// `hash` into this empty slot.
    pub fn construct_by_hash(
        &mut self,
        alloc: &SharedAlloc,
        hash: u64,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        debug_assert!(self.is_empty());
        let info = get_type(hash)?;
        let data = alloc.allocate(info.size)?;
        debug!(type_name = info.name, ptr = ?data, "constructing field");
        if let Err(e) = unsafe { (info.construct_fn)(alloc, data.as_ptr(), parent) } {
            alloc.deallocate(data.as_ptr());
            return Err(e);
        }
        self.type_hash = hash;
        self.data.set(data.as_ptr());
        Ok(())
    }

    /// Destroys and deallocates the owned value, leaving the slot empty.
    pub fn clear(&mut self, alloc: &SharedAlloc) -> Result<()> {
        if !self.data.is_null() {
            let info = get_type(self.type_hash)?;
            debug!(type_name = info.name, "clearing field");
            unsafe { (info.destroy_fn)(alloc, self.data.get()) };
            alloc.deallocate(self.data.get());
        }
        self.data.set(ptr::null());
        self.type_hash = 0;
        Ok(())
    }

    /// Detaches from externally owned storage without running a destructor.
    pub fn clear_unmanaged(&mut self) {
        self.data.set(ptr::null());
        self.type_hash = 0;
    }

    /// Same-type value copy through the registered copy function.
    pub(crate) fn copy_from(&mut self, alloc: &SharedAlloc, other: &Field) -> Result<()> {
        if self.is_empty() || other.is_empty() || self.type_hash != other.type_hash {
            return Err(Error::TypeMismatch {
                expected: self.type_hash,
                actual: other.type_hash,
            });
        }
        let info = get_type(self.type_hash)?;
        unsafe { (info.copy_fn)(alloc, self.data.get(), other.data.get()) }
    }

    /// Allocates, default-constructs and value-copies from `other` into this
    /// empty slot. A partial failure leaves the slot empty.
    pub(crate) fn construct_copy_from(
        &mut self,
        alloc: &SharedAlloc,
        other: &Field,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        debug_assert!(self.is_empty());
        if other.is_empty() {
            return Ok(());
        }
        let info = get_type(other.type_hash)?;
        let data = alloc.allocate(info.size)?;
        unsafe {
            if let Err(e) = (info.construct_fn)(alloc, data.as_ptr(), parent) {
                alloc.deallocate(data.as_ptr());
                return Err(e);
            }
            if let Err(e) = (info.copy_fn)(alloc, data.as_ptr(), other.data.get()) {
                (info.destroy_fn)(alloc, data.as_ptr());
                alloc.deallocate(data.as_ptr());
                return Err(e);
            }
        }
        self.type_hash = other.type_hash;
        self.data.set(data.as_ptr());
        Ok(())
    }

    /// Swaps two slots in place. Only legal when both fields are owned by the
    /// same allocator; the containers enforce that before delegating here.
    pub(crate) fn swap(&mut self, other: &mut Field) {
        mem::swap(&mut self.type_hash, &mut other.type_hash);
        let a = self.data.get();
        let b = other.data.get();
        self.data.set(b);
        other.data.set(a);
    }

    /// Deep equality: both empty fields are equal, different types are not,
    /// same types delegate to the registered comparison.
    pub fn equals(&self, other: &Field) -> Result<bool> {
        if self.is_empty() {
            return Ok(other.is_empty());
        }
        if other.is_empty() || self.type_hash != other.type_hash {
            return Ok(false);
        }
        let info = get_type(self.type_hash)?;
        unsafe { (info.equal_fn)(self.data.get(), other.data.get()) }
    }

    pub(crate) fn write_text(&self, f: &mut dyn fmt::Write) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("null");
        }
        let info = get_type(self.type_hash).map_err(|_| fmt::Error)?;
        unsafe { (info.text_fn)(f, self.data.get()) }
    }

    pub(crate) fn to_yaml(&self) -> Result<serde_yaml::Value> {
        if self.is_empty() {
            return Ok(serde_yaml::Value::Null);
        }
        let info = get_type(self.type_hash)?;
        unsafe { (info.yaml_fn)(self.data.get()) }
    }

    /// Audits the slot: empty fields are untyped, owned data lies in the
    /// region, and the value's own invariants hold.
    pub(crate) fn check(
        &self,
        alloc: &SharedAlloc,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        alloc.assert_owned(self.data.get())?;
        let info = get_type(self.type_hash)?;
        unsafe { (info.check_fn)(alloc, self.data.get(), parent) }
    }
}

impl Drop for Field {
    fn drop(&mut self) {
        if !self.data.is_null() {
            let name = get_type_name(self.type_hash).unwrap_or("<unknown>");
            panic!("field of type '{name}' dropped while still initialized");
        }
    }
}

// SAFETY: re-bases the data pointer for the destination slot; the source is
// forgotten by the caller.
unsafe impl Relocate for Field {
    unsafe fn relocate(src: *mut Self, dst: *mut Self) {
        let target = (*src).data.get();
        (*dst).type_hash = (*src).type_hash;
        ptr::write(ptr::addr_of_mut!((*dst).data), OffsetPtr::null());
        (*dst).data.set(target);
    }
}

/// Host values assignable into a field: scalars construct-and-store, string
/// slices construct a region [`Str`](crate::containers::Str).
pub trait FieldValue {
    fn assign_to(
        &self,
        alloc: &SharedAlloc,
        field: &mut Field,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()>;
}

macro_rules! scalar_field_value {
    ($($t:ty),*) => {
        $(
            impl FieldValue for $t {
                fn assign_to(
                    &self,
                    alloc: &SharedAlloc,
                    field: &mut Field,
                    parent: Option<NonNull<FieldBase>>,
                ) -> Result<()> {
                    *field.get_or_construct::<$t>(alloc, parent)? = *self;
                    Ok(())
                }
            }
        )*
    };
}

scalar_field_value!(i32, i64, f64, bool);

impl FieldValue for &str {
    fn assign_to(
        &self,
        alloc: &SharedAlloc,
        field: &mut Field,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        field
            .get_or_construct::<crate::containers::Str>(alloc, parent)?
            .assign(self)
    }
}

impl FieldValue for String {
    fn assign_to(
        &self,
        alloc: &SharedAlloc,
        field: &mut Field,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        self.as_str().assign_to(alloc, field, parent)
    }
}
