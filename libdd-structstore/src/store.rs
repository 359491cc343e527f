// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The store façade.
//!
//! A [`StructStore`] is a [`FieldMap`] behind a reader-writer lock, itself a
//! registered field type so stores nest arbitrarily. Managed stores own their
//! fields; unmanaged stores present a fixed set of externally owned objects
//! (a host-language struct) under names.
//!
//! Stores are constructed inside their owning allocator and cleared
//! explicitly before teardown. They deep-copy across allocators but never
//! move across allocators. [`LocalStore`] is the owning handle for stores
//! backed by the process-local allocator.

use crate::error::{with_frame, Error, Result};
use crate::field::{Field, FieldBase, FieldValue};
use crate::fieldmap::FieldMap;
use crate::typing::FieldType;
use core::fmt;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::ptr::NonNull;
use libdd_structstore_alloc::{static_alloc, ReadGuard, SharedAlloc, WriteGuard};
use tracing::{debug, error};

#[repr(C)]
pub struct StructStore {
    base: FieldBase,
    map: FieldMap,
}

impl StructStore {
    /// Constructs a store in place.
    ///
    /// # Safety
    /// `this` points to uninitialized memory allocated from `alloc` (or
    /// otherwise pinned for the store's lifetime); the store must be torn
    /// down with [`destroy_at`](FieldType::destroy_at) or equivalent.
    pub(crate) unsafe fn init(
        this: *mut StructStore,
        alloc: &SharedAlloc,
        managed: bool,
        parent: Option<NonNull<FieldBase>>,
    ) {
        debug!(addr = ?this, managed, "constructing store");
        FieldBase::init(ptr::addr_of_mut!((*this).base), parent);
        FieldMap::init(ptr::addr_of_mut!((*this).map), alloc, managed);
    }

    pub fn managed(&self) -> bool {
        self.map.managed()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub(crate) fn alloc_ref(&self) -> &SharedAlloc {
        self.map.alloc_ref()
    }

    fn parent_of_fields(&self) -> NonNull<FieldBase> {
        NonNull::from(&self.base)
    }

    /// Sets `name` to `value`, creating the field if needed. A failed
    /// assignment leaves the store unchanged.
    pub fn set(&mut self, name: &str, value: impl FieldValue) -> Result<()> {
        let parent = self.parent_of_fields();
        let alloc: &SharedAlloc = unsafe { &*(self.alloc_ref() as *const SharedAlloc) };
        let (field, inserted) = self.map.get_or_insert(name)?;
        if let Err(e) = value.assign_to(alloc, field, Some(parent)) {
            if inserted {
                let _ = self.map.remove(name);
            }
            return Err(e);
        }
        Ok(())
    }

    /// The field bound to `name`, or [`Error::FieldNotFound`].
    pub fn field(&self, name: &str) -> Result<&Field> {
        self.map
            .try_get(name)?
            .ok_or_else(|| Error::FieldNotFound(name.to_string()))
    }

    pub fn field_mut(&mut self, name: &str) -> Result<&mut Field> {
        self.map
            .try_get_mut(name)?
            .ok_or_else(|| Error::FieldNotFound(name.to_string()))
    }

    /// Typed shared access to an existing field.
    pub fn get<T: FieldType>(&self, name: &str) -> Result<&T> {
        self.field(name)?.get_ref::<T>()
    }

    /// Typed exclusive access to an existing field.
    pub fn get_mut<T: FieldType>(&mut self, name: &str) -> Result<&mut T> {
        self.field_mut(name)?.get_mut::<T>()
    }

    /// Typed access, creating and default-constructing the field if absent.
    /// Managed stores only.
    pub fn get_or_create<T: FieldType>(&mut self, name: &str) -> Result<&mut T> {
        let parent = self.parent_of_fields();
        let alloc: &SharedAlloc = unsafe { &*(self.alloc_ref() as *const SharedAlloc) };
        // hold the map borrow only while constructing; the raw pointer lets
        // the rollback path re-borrow the map
        let constructed: std::result::Result<*mut T, (Error, bool)> = {
            let (field, inserted) = self.map.get_or_insert(name)?;
            match field.get_or_construct::<T>(alloc, Some(parent)) {
                Ok(value) => Ok(value as *mut T),
                Err(e) => Err((e, inserted)),
            }
        };
        match constructed {
            Ok(value) => Ok(unsafe { &mut *value }),
            Err((e, inserted)) => {
                if inserted {
                    let _ = self.map.remove(name);
                }
                Err(e)
            }
        }
    }

    /// Nested store under `name`, created on first use.
    pub fn substore(&mut self, name: &str) -> Result<&mut StructStore> {
        self.get_or_create::<StructStore>(name)
    }

    /// Binds an externally owned object under `name`. Unmanaged stores only.
    ///
    /// # Safety
    /// `value` must outlive this store's binding and must not move.
    pub unsafe fn store_ref<T: FieldType>(&mut self, name: &str, value: NonNull<T>) -> Result<()> {
        let parent = self.parent_of_fields();
        self.map.store_ref(name, value, parent)
    }

    /// Removes and destroys the named field. Managed stores only.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        self.map.remove(name)
    }

    /// Clears every field. Idempotent. Managed stores only.
    pub fn clear(&mut self) -> Result<()> {
        self.map.clear()
    }

    /// Detaches every unmanaged binding without running destructors.
    pub fn clear_unmanaged(&mut self) -> Result<()> {
        self.map.clear_unmanaged()
    }

    /// Field names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.map.names()
    }

    /// `(name, field)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.map.iter()
    }

    /// Takes the store's read lock and returns a guard granting shared
    /// access through it.
    pub fn lock_read(&self) -> Result<StoreReadGuard<'_>> {
        Ok(StoreReadGuard {
            guard: self.base.read_lock()?,
            store: self,
        })
    }

    /// Takes the store's write lock and returns a guard granting exclusive
    /// access through it.
    pub fn lock_write(&mut self) -> StoreWriteGuard<'_> {
        let store = NonNull::from(&mut *self);
        // the guard borrows the lock word through a raw-derived reference so
        // the store stays reachable through the guard itself
        let base: &FieldBase = unsafe { &(*store.as_ptr()).base };
        StoreWriteGuard {
            guard: base.write_lock(),
            store,
            _marker: PhantomData,
        }
    }

    /// Deep equality by name sequence and field values; works across
    /// allocators.
    pub fn equals(&self, other: &StructStore) -> Result<bool> {
        self.map.equals(&other.map)
    }

    /// Deep copy. Managed destinations are cleared and rebuilt from the
    /// source; unmanaged destinations require matching name sequences and
    /// copy in place. Mixing modes fails with
    /// [`Error::ManagedModeViolation`]. On failure a managed destination is
    /// left empty.
    pub fn copy_from(&mut self, other: &StructStore) -> Result<()> {
        let parent = self.parent_of_fields();
        match (self.managed(), other.managed()) {
            (true, true) => self.map.copy_from_managed(&other.map, Some(parent)),
            (false, false) => self.map.copy_from_unmanaged(&other.map),
            _ => Err(Error::ManagedModeViolation),
        }
    }

    /// Moves the contents of `other` into this store. With the same
    /// allocator this is a pointer-level exchange; across allocators it
    /// degrades to a deep copy and leaves `other` untouched. Managed stores
    /// only.
    pub fn move_from(&mut self, other: &mut StructStore) -> Result<()> {
        if !self.managed() || !other.managed() {
            return Err(Error::ManagedModeViolation);
        }
        if !self.map.same_alloc(&other.map) {
            return self.copy_from(other);
        }
        self.clear()?;
        // same allocator: the interned indices are shared, swap field slots
        let names: Vec<String> = other.names().map(str::to_string).collect();
        for name in &names {
            let src = other.field_mut(name)? as *mut Field;
            let (dst, _) = self.map.get_or_insert(name)?;
            unsafe { dst.swap(&mut *src) };
        }
        other.clear()?;
        Ok(())
    }

    pub fn to_yaml(&self) -> Result<serde_yaml::Value> {
        self.map.to_yaml()
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.to_yaml()?)?)
    }

    /// Tears the store down in place: clears according to the managed mode,
    /// then releases the map's own storage.
    ///
    /// # Safety
    /// `this` must point to a live store that is not used afterwards.
    pub(crate) unsafe fn destroy(this: *mut StructStore) {
        let store = &mut *this;
        let cleared = if store.managed() {
            store.clear()
        } else {
            store.clear_unmanaged()
        };
        if let Err(e) = cleared {
            error!(error = %e, "clearing store during teardown");
        }
        store.map.dispose();
    }

    /// Deep invariant audit of the store and everything under it.
    pub fn check(&self) -> Result<()> {
        with_frame(
            self.map.check(self.alloc_ref(), Some(self.parent_of_fields())),
            || "store check".to_string(),
        )
    }
}

impl fmt::Display for StructStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.map.write_text(f)
    }
}

/// Shared access to a store while its read lock is held.
#[must_use]
pub struct StoreReadGuard<'a> {
    store: &'a StructStore,
    guard: ReadGuard<'a>,
}

impl StoreReadGuard<'_> {
    pub fn unlock(self) {
        self.guard.unlock();
    }
}

impl Deref for StoreReadGuard<'_> {
    type Target = StructStore;

    fn deref(&self) -> &StructStore {
        self.store
    }
}

/// Exclusive access to a store while its write lock is held.
#[must_use]
pub struct StoreWriteGuard<'a> {
    store: NonNull<StructStore>,
    guard: WriteGuard<'a>,
    _marker: PhantomData<&'a mut StructStore>,
}

impl StoreWriteGuard<'_> {
    pub fn unlock(self) {
        self.guard.unlock();
    }
}

impl Deref for StoreWriteGuard<'_> {
    type Target = StructStore;

    fn deref(&self) -> &StructStore {
        unsafe { self.store.as_ref() }
    }
}

impl DerefMut for StoreWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut StructStore {
        unsafe { self.store.as_mut() }
    }
}

impl FieldType for StructStore {
    const NAME: &'static str = "store";

    unsafe fn construct_at(
        alloc: &SharedAlloc,
        this: *mut Self,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        StructStore::init(this, alloc, true, parent);
        Ok(())
    }

    unsafe fn destroy_at(alloc: &SharedAlloc, this: *mut Self) {
        let _ = alloc;
        StructStore::destroy(this);
    }

    unsafe fn copy_assign(_alloc: &SharedAlloc, dst: *mut Self, src: *const Self) -> Result<()> {
        (*dst).copy_from(&*src)
    }

    fn equals(a: &Self, b: &Self) -> Result<bool> {
        a.equals(b)
    }

    fn write_text(f: &mut dyn fmt::Write, v: &Self) -> fmt::Result {
        v.map.write_text(f)
    }

    fn to_yaml(v: &Self) -> Result<serde_yaml::Value> {
        v.to_yaml()
    }

    unsafe fn check_value(
        alloc: &SharedAlloc,
        v: &Self,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        if !v.base.parent_matches(parent) {
            return Err(Error::ParentMismatch { type_name: Self::NAME });
        }
        alloc.assert_owned(v as *const Self)?;
        v.map.check(alloc, Some(NonNull::from(&v.base)))
    }

    unsafe fn set_parent(this: *mut Self, parent: Option<NonNull<FieldBase>>) {
        (*this).base.set_parent(parent);
    }
}

/// Owning handle for a store backed by the process-local allocator. The
/// store itself lives inside the allocator's heap; the handle clears and
/// releases it on drop.
pub struct LocalStore {
    ptr: NonNull<StructStore>,
}

impl LocalStore {
    /// A fresh managed store in the process-local allocator.
    pub fn new() -> Result<LocalStore> {
        Self::with_mode(true)
    }

    /// A fresh unmanaged store, ready to bind externally owned objects via
    /// [`StructStore::store_ref`].
    pub fn new_unmanaged() -> Result<LocalStore> {
        Self::with_mode(false)
    }

    fn with_mode(managed: bool) -> Result<LocalStore> {
        let alloc = static_alloc();
        let ptr = alloc.allocate_one::<StructStore>()?;
        unsafe { StructStore::init(ptr.as_ptr(), alloc, managed, None) };
        Ok(LocalStore { ptr })
    }
}

impl Deref for LocalStore {
    type Target = StructStore;

    fn deref(&self) -> &StructStore {
        unsafe { self.ptr.as_ref() }
    }
}

impl DerefMut for LocalStore {
    fn deref_mut(&mut self) -> &mut StructStore {
        unsafe { self.ptr.as_mut() }
    }
}

impl Drop for LocalStore {
    fn drop(&mut self) {
        unsafe {
            StructStore::destroy(self.ptr.as_ptr());
            static_alloc().deallocate(self.ptr.as_ptr() as *mut u8);
        }
    }
}
