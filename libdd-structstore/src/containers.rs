// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in composite field types: [`Str`], [`List`] and [`Matrix`].
//!
//! All three live entirely in region memory, embed a [`FieldBase`] header
//! (owner back-reference + per-field lock) and keep an [`OffsetPtr`] to their
//! allocator so that value operations never need ambient context.

use crate::error::{with_frame, Error, Result};
use crate::field::{Field, FieldBase, FieldValue};
use crate::typing::FieldType;
use core::fmt;
use core::fmt::Write as _;
use core::ptr;
use core::ptr::NonNull;
use libdd_structstore_alloc::{
    OffsetPtr, ReadGuard, SharedAlloc, ShrString, ShrVec, WriteGuard,
};

// ---------------------------------------------------------------------------
// Str
// ---------------------------------------------------------------------------

/// Owning string whose character buffer is allocated from the region.
#[repr(C)]
pub struct Str {
    base: FieldBase,
    alloc: OffsetPtr<SharedAlloc>,
    buf: ShrString,
}

impl Str {
    pub fn as_str(&self) -> &str {
        self.buf.as_str()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Replaces the content, copying `s` into the region.
    pub fn assign(&mut self, s: &str) -> Result<()> {
        let alloc = unsafe { &*self.alloc.get() };
        self.buf.assign(alloc, s)?;
        Ok(())
    }

    /// Appends to the content.
    pub fn push_str(&mut self, s: &str) -> Result<()> {
        if s.is_empty() {
            return Ok(());
        }
        let combined = format!("{}{}", self.buf.as_str(), s);
        self.assign(&combined)
    }
}

impl FieldType for Str {
    const NAME: &'static str = "str";

    unsafe fn construct_at(
        alloc: &SharedAlloc,
        this: *mut Self,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        FieldBase::init(ptr::addr_of_mut!((*this).base), parent);
        ptr::write(ptr::addr_of_mut!((*this).alloc), OffsetPtr::null());
        (*this).alloc.set(alloc);
        ptr::write(ptr::addr_of_mut!((*this).buf), ShrString::new());
        Ok(())
    }

    unsafe fn destroy_at(alloc: &SharedAlloc, this: *mut Self) {
        (*this).buf.dispose(alloc);
    }

    unsafe fn copy_assign(alloc: &SharedAlloc, dst: *mut Self, src: *const Self) -> Result<()> {
        (*dst).buf.assign(alloc, (*src).buf.as_str())?;
        Ok(())
    }

    fn equals(a: &Self, b: &Self) -> Result<bool> {
        Ok(a.buf == b.buf)
    }

    fn write_text(f: &mut dyn fmt::Write, v: &Self) -> fmt::Result {
        write!(f, "\"{}\"", v.as_str())
    }

    fn to_yaml(v: &Self) -> Result<serde_yaml::Value> {
        Ok(serde_yaml::Value::String(v.as_str().to_string()))
    }

    unsafe fn check_value(
        alloc: &SharedAlloc,
        v: &Self,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        if !v.base.parent_matches(parent) {
            return Err(Error::ParentMismatch { type_name: Self::NAME });
        }
        with_frame(alloc.assert_owned(v as *const Self).map_err(Error::from), || {
            "str".to_string()
        })?;
        if !v.buf.is_empty() {
            with_frame(
                alloc.assert_owned(v.buf.data_ptr()).map_err(Error::from),
                || "str data".to_string(),
            )?;
        }
        Ok(())
    }

    unsafe fn set_parent(this: *mut Self, parent: Option<NonNull<FieldBase>>) {
        (*this).base.set_parent(parent);
    }
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

/// Ordered sequence of fields, every one managed by the list.
#[repr(C)]
pub struct List {
    base: FieldBase,
    alloc: OffsetPtr<SharedAlloc>,
    items: ShrVec<Field>,
}

impl List {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Appends an empty field and returns it for construction.
    pub fn push_back(&mut self) -> Result<&mut Field> {
        let alloc = unsafe { &*self.alloc.get() };
        Ok(self.items.push(alloc, Field::empty())?)
    }

    /// Appends a value.
    pub fn push_back_value(&mut self, value: impl FieldValue) -> Result<()> {
        let parent = NonNull::from(&self.base);
        let alloc: &SharedAlloc = unsafe { &*self.alloc.get() };
        let field = self.items.push(alloc, Field::empty())?;
        if let Err(e) = value.assign_to(alloc, field, Some(parent)) {
            let last = self.items.len() - 1;
            self.items.remove(last);
            return Err(e);
        }
        Ok(())
    }

    /// Inserts an empty field at `index` and returns it for construction.
    pub fn insert(&mut self, index: usize) -> Result<&mut Field> {
        if index > self.items.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.items.len(),
            });
        }
        let alloc = unsafe { &*self.alloc.get() };
        self.items.insert(alloc, index, Field::empty())?;
        Ok(&mut self.items.as_mut_slice()[index])
    }

    /// Inserts a value at `index`.
    pub fn insert_value(&mut self, index: usize, value: impl FieldValue) -> Result<()> {
        let parent = NonNull::from(&self.base);
        let alloc: &SharedAlloc = unsafe { &*self.alloc.get() };
        if index > self.items.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.items.len(),
            });
        }
        self.items.insert(alloc, index, Field::empty())?;
        let field = &mut self.items.as_mut_slice()[index];
        if let Err(e) = value.assign_to(alloc, field, Some(parent)) {
            self.items.remove(index);
            return Err(e);
        }
        Ok(())
    }

    pub fn get(&self, index: usize) -> Result<&Field> {
        self.items.get(index).ok_or(Error::IndexOutOfRange {
            index,
            len: self.items.len(),
        })
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut Field> {
        let len = self.items.len();
        self.items
            .get_mut(index)
            .ok_or(Error::IndexOutOfRange { index, len })
    }

    /// Clears the field at `index` and removes it from the sequence.
    pub fn erase(&mut self, index: usize) -> Result<()> {
        if index >= self.items.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: self.items.len(),
            });
        }
        let alloc = unsafe { &*self.alloc.get() };
        self.items.as_mut_slice()[index].clear(alloc)?;
        self.items.remove(index);
        Ok(())
    }

    /// Clears every contained field.
    pub fn clear(&mut self) -> Result<()> {
        let alloc = unsafe { &*self.alloc.get() };
        for field in self.items.iter_mut() {
            field.clear(alloc)?;
        }
        self.items.clear_discard();
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Field> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Field> {
        self.items.iter_mut()
    }

    /// Takes the list's read lock and returns a guard granting shared
    /// access through it.
    pub fn lock_read(&self) -> Result<ListReadGuard<'_>> {
        Ok(ListReadGuard {
            guard: self.base.read_lock()?,
            list: self,
        })
    }

    /// Takes the list's write lock and returns a guard granting exclusive
    /// access through it.
    pub fn lock_write(&mut self) -> ListWriteGuard<'_> {
        let list = NonNull::from(&mut *self);
        // the guard borrows the lock word through a raw-derived reference so
        // the list stays reachable through the guard itself
        let base: &FieldBase = unsafe { &(*list.as_ptr()).base };
        ListWriteGuard {
            guard: base.write_lock(),
            list,
            _marker: core::marker::PhantomData,
        }
    }
}

/// Shared access to a list while its read lock is held.
#[must_use]
pub struct ListReadGuard<'a> {
    list: &'a List,
    guard: ReadGuard<'a>,
}

impl ListReadGuard<'_> {
    pub fn unlock(self) {
        self.guard.unlock();
    }
}

impl core::ops::Deref for ListReadGuard<'_> {
    type Target = List;

    fn deref(&self) -> &List {
        self.list
    }
}

/// Exclusive access to a list while its write lock is held.
#[must_use]
pub struct ListWriteGuard<'a> {
    list: NonNull<List>,
    guard: WriteGuard<'a>,
    _marker: core::marker::PhantomData<&'a mut List>,
}

impl ListWriteGuard<'_> {
    pub fn unlock(self) {
        self.guard.unlock();
    }
}

impl core::ops::Deref for ListWriteGuard<'_> {
    type Target = List;

    fn deref(&self) -> &List {
        unsafe { self.list.as_ref() }
    }
}

impl core::ops::DerefMut for ListWriteGuard<'_> {
    fn deref_mut(&mut self) -> &mut List {
        unsafe { self.list.as_mut() }
    }
}

impl fmt::Display for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for field in self.items.iter() {
            field.write_text(f)?;
            f.write_str(",")?;
        }
        f.write_str("]")
    }
}

impl FieldType for List {
    const NAME: &'static str = "list";

    unsafe fn construct_at(
        alloc: &SharedAlloc,
        this: *mut Self,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        FieldBase::init(ptr::addr_of_mut!((*this).base), parent);
        ptr::write(ptr::addr_of_mut!((*this).alloc), OffsetPtr::null());
        (*this).alloc.set(alloc);
        ptr::write(ptr::addr_of_mut!((*this).items), ShrVec::new());
        Ok(())
    }

    unsafe fn destroy_at(alloc: &SharedAlloc, this: *mut Self) {
        // a constructed list only ever holds registered types, so teardown
        // cannot fail on lookup
        for field in (*this).items.iter_mut() {
            if let Err(e) = field.clear(alloc) {
                tracing::error!(error = %e, "clearing list element during teardown");
                field.clear_unmanaged();
            }
        }
        (*this).items.clear_discard();
        (*this).items.dispose(alloc);
    }

    unsafe fn copy_assign(alloc: &SharedAlloc, dst: *mut Self, src: *const Self) -> Result<()> {
        // replace semantics: the destination is cleared first
        let dst = &mut *dst;
        let src = &*src;
        dst.clear()?;
        let parent = NonNull::from(&dst.base);
        for field in src.items.iter() {
            let slot = dst.items.push(alloc, Field::empty())?;
            if let Err(e) = slot.construct_copy_from(alloc, field, Some(parent)) {
                dst.clear()?;
                return Err(e);
            }
        }
        Ok(())
    }

    fn equals(a: &Self, b: &Self) -> Result<bool> {
        if a.len() != b.len() {
            return Ok(false);
        }
        for (x, y) in a.items.iter().zip(b.items.iter()) {
            if !x.equals(y)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn write_text(f: &mut dyn fmt::Write, v: &Self) -> fmt::Result {
        f.write_str("[")?;
        for field in v.items.iter() {
            field.write_text(f)?;
            f.write_str(",")?;
        }
        f.write_str("]")
    }

    fn to_yaml(v: &Self) -> Result<serde_yaml::Value> {
        let mut seq = Vec::with_capacity(v.len());
        for field in v.items.iter() {
            seq.push(field.to_yaml()?);
        }
        Ok(serde_yaml::Value::Sequence(seq))
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
        let self_base = Some(NonNull::from(&v.base));
        for (i, field) in v.items.iter().enumerate() {
            with_frame(field.check(alloc, self_base), || format!("in list index {i}"))?;
        }
        Ok(())
    }

    unsafe fn set_parent(this: *mut Self, parent: Option<NonNull<FieldBase>>) {
        (*this).base.set_parent(parent);
    }
}

// ---------------------------------------------------------------------------
// Matrix
// ---------------------------------------------------------------------------

pub const MATRIX_MAX_DIMS: usize = 8;

/// Dense row-major `f64` array with up to [`MATRIX_MAX_DIMS`] dimensions.
#[repr(C)]
pub struct Matrix {
    base: FieldBase,
    alloc: OffsetPtr<SharedAlloc>,
    ndim: usize,
    shape: [usize; MATRIX_MAX_DIMS],
    data: OffsetPtr<f64>,
}

impl Matrix {
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape[..self.ndim]
    }

    /// Element count: the product of the shape.
    pub fn element_count(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn elements(&self) -> &[f64] {
        let count = self.element_count();
        if count == 0 || self.data.is_null() {
            return &[];
        }
        unsafe { core::slice::from_raw_parts(self.data.get(), count) }
    }

    pub fn elements_mut(&mut self) -> &mut [f64] {
        let count = self.element_count();
        if count == 0 || self.data.is_null() {
            return &mut [];
        }
        unsafe { core::slice::from_raw_parts_mut(self.data.get(), count) }
    }

    /// Reshapes the matrix, reallocating its buffer, and bulk-copies `data`
    /// when given (its length must match the new shape). Without `data` the
    /// elements are zeroed. Passing the matrix's own buffer requires an
    /// identical shape and is a no-op.
    pub fn from(&mut self, shape: &[usize], data: Option<&[f64]>) -> Result<()> {
        if shape.len() > MATRIX_MAX_DIMS {
            return Err(Error::MatrixInvalidShape);
        }
        let mut count = 1usize;
        for &dim in shape {
            count = count.checked_mul(dim).ok_or(Error::MatrixInvalidShape)?;
        }
        if let Some(d) = data {
            if d.as_ptr() == self.data.get() as *const f64 && !self.data.is_null() {
                if shape != self.shape() {
                    return Err(Error::MatrixShapeMismatch);
                }
                return Ok(());
            }
            if d.len() != count {
                return Err(Error::MatrixShapeMismatch);
            }
        }
        let alloc = unsafe { &*self.alloc.get() };
        let new_data = if count > 0 {
            let p = alloc.allocate(count * core::mem::size_of::<f64>())?.as_ptr() as *mut f64;
            match data {
                Some(d) => unsafe { ptr::copy_nonoverlapping(d.as_ptr(), p, count) },
                None => unsafe { ptr::write_bytes(p, 0, count) },
            }
            p
        } else {
            ptr::null_mut()
        };
        if !self.data.is_null() {
            alloc.deallocate(self.data.get() as *mut u8);
        }
        self.ndim = shape.len();
        self.shape = [0; MATRIX_MAX_DIMS];
        self.shape[..shape.len()].copy_from_slice(shape);
        self.data.set(new_data);
        Ok(())
    }
}

impl FieldType for Matrix {
    const NAME: &'static str = "matrix";

    unsafe fn construct_at(
        alloc: &SharedAlloc,
        this: *mut Self,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        FieldBase::init(ptr::addr_of_mut!((*this).base), parent);
        ptr::write(ptr::addr_of_mut!((*this).alloc), OffsetPtr::null());
        (*this).alloc.set(alloc);
        (*this).ndim = 0;
        (*this).shape = [0; MATRIX_MAX_DIMS];
        ptr::write(ptr::addr_of_mut!((*this).data), OffsetPtr::null());
        Ok(())
    }

    unsafe fn destroy_at(alloc: &SharedAlloc, this: *mut Self) {
        let data = (*this).data.get();
        if !data.is_null() {
            alloc.deallocate(data as *mut u8);
            (*this).data.set(ptr::null());
        }
    }

    unsafe fn copy_assign(_alloc: &SharedAlloc, dst: *mut Self, src: *const Self) -> Result<()> {
        let src = &*src;
        (*dst).from(src.shape(), Some(src.elements()))
    }

    fn equals(a: &Self, b: &Self) -> Result<bool> {
        Ok(a.ndim == b.ndim && a.shape() == b.shape() && a.elements() == b.elements())
    }

    fn write_text(f: &mut dyn fmt::Write, v: &Self) -> fmt::Result {
        f.write_str("[")?;
        for e in v.elements() {
            write!(f, "{e},")?;
        }
        f.write_str("]")
    }

    fn to_yaml(_v: &Self) -> Result<serde_yaml::Value> {
        Err(Error::UnsupportedSerialization(Self::NAME))
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
        if !v.data.is_null() {
            with_frame(alloc.assert_owned(v.data.get()).map_err(Error::from), || {
                "matrix data".to_string()
            })?;
        }
        Ok(())
    }

    unsafe fn set_parent(this: *mut Self, parent: Option<NonNull<FieldBase>>) {
        (*this).base.set_parent(parent);
    }
}
