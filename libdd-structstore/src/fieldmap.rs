// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ordered name-to-field mapping.
//!
//! A [`FieldMap`] keeps two structures in region memory: `slots`, the
//! insertion-ordered sequence of interned name indices, and an open-hash
//! bucket table from name index to [`Field`]. Name lookups always go through
//! the region's [`StringStorage`] interning table, so the map itself only
//! ever compares small integers; comparing two maps from different regions
//! falls back to string content.
//!
//! The map runs in one of two modes, fixed at construction: *managed* maps
//! own and allocate their fields, *unmanaged* maps bind externally owned
//! object addresses under names. Using an operation of the wrong mode fails
//! with [`Error::ManagedModeViolation`].

use crate::error::{with_frame, Error, Result};
use crate::field::{Field, FieldBase};
use crate::typing::FieldType;
use core::fmt;
use core::fmt::Write as _;
use core::ptr;
use core::ptr::NonNull;
use libdd_structstore_alloc::{OffsetPtr, Relocate, SharedAlloc, StrIdx, ShrVec};

const TOMBSTONE: u32 = u32::MAX;

#[repr(C)]
struct Bucket {
    // interned name index; 0 vacant, u32::MAX deleted
    name: u32,
    field: Field,
}

#[repr(C)]
pub struct FieldMap {
    alloc: OffsetPtr<SharedAlloc>,
    slots: ShrVec<StrIdx>,
    table: OffsetPtr<Bucket>,
    cap: u32,
    // occupied + tombstoned buckets
    used: u32,
    managed: bool,
}

impl FieldMap {
    /// # Safety
    /// `this` points to uninitialized region memory; the map must be torn
    /// down via [`clear`](FieldMap::clear)/[`clear_unmanaged`] and
    /// [`dispose`](FieldMap::dispose).
    pub(crate) unsafe fn init(this: *mut FieldMap, alloc: &SharedAlloc, managed: bool) {
        ptr::write(ptr::addr_of_mut!((*this).alloc), OffsetPtr::null());
        (*this).alloc.set(alloc);
        ptr::write(ptr::addr_of_mut!((*this).slots), ShrVec::new());
        ptr::write(ptr::addr_of_mut!((*this).table), OffsetPtr::null());
        (*this).cap = 0;
        (*this).used = 0;
        (*this).managed = managed;
    }

    #[inline]
    pub fn managed(&self) -> bool {
        self.managed
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    fn alloc_ptr(&self) -> *const SharedAlloc {
        self.alloc.get()
    }

    pub(crate) fn alloc_ref(&self) -> &SharedAlloc {
        // SAFETY: set at init, lives as long as the region.
        unsafe { &*self.alloc.get() }
    }

    pub(crate) fn same_alloc(&self, other: &FieldMap) -> bool {
        self.alloc_ptr() == other.alloc_ptr()
    }

    fn hash_idx(idx: u32) -> u64 {
        // splitmix64; any deterministic mix works, every process probes alike
        let mut z = (idx as u64).wrapping_add(0x9e3779b97f4a7c15);
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d049bb133111eb);
        z ^ (z >> 31)
    }

    #[inline]
    unsafe fn bucket_at(&self, i: usize) -> *mut Bucket {
        self.table.get().add(i)
    }

    fn find_bucket(&self, idx: StrIdx) -> Option<usize> {
        if self.cap == 0 {
            return None;
        }
        let mask = self.cap as usize - 1;
        let mut i = Self::hash_idx(idx.index()) as usize & mask;
        // SAFETY: the table holds `cap` buckets and always has vacancies.
        unsafe {
            loop {
                let b = self.bucket_at(i);
                if (*b).name == 0 {
                    return None;
                }
                if (*b).name == idx.index() {
                    return Some(i);
                }
                i = (i + 1) & mask;
            }
        }
    }

    fn rehash(&mut self, alloc: &SharedAlloc, new_cap: usize) -> Result<()> {
        debug_assert!(new_cap.is_power_of_two());
        let new_table = alloc
            .allocate(new_cap * core::mem::size_of::<Bucket>())?
            .as_ptr() as *mut Bucket;
        // vacant means name == 0; field bytes of vacant buckets are never read
        unsafe {
            for i in 0..new_cap {
                (*new_table.add(i)).name = 0;
            }
            let old_table = self.table.get();
            let mask = new_cap - 1;
            for i in 0..self.cap as usize {
                let old = old_table.add(i);
                if (*old).name == 0 || (*old).name == TOMBSTONE {
                    continue;
                }
                let mut j = Self::hash_idx((*old).name) as usize & mask;
                while (*new_table.add(j)).name != 0 {
                    j = (j + 1) & mask;
                }
                let new = new_table.add(j);
                (*new).name = (*old).name;
                Field::relocate(
                    ptr::addr_of_mut!((*old).field),
                    ptr::addr_of_mut!((*new).field),
                );
            }
            if !old_table.is_null() {
                alloc.deallocate(old_table as *mut u8);
            }
        }
        self.table.set(new_table);
        self.cap = new_cap as u32;
        self.used = self.slots.len() as u32;
        Ok(())
    }

    fn ensure_capacity(&mut self, alloc: &SharedAlloc) -> Result<()> {
        if self.cap == 0 || (self.used + 1) * 4 > self.cap * 3 {
            let new_cap = ((self.slots.len() + 1) * 2).next_power_of_two().max(16);
            self.rehash(alloc, new_cap)?;
        }
        Ok(())
    }

    /// Writes a fresh empty field under `idx`. Capacity must have been
    /// ensured; the caller must know `idx` is absent.
    unsafe fn insert_empty(&mut self, idx: StrIdx) -> &mut Field {
        let mask = self.cap as usize - 1;
        let mut i = Self::hash_idx(idx.index()) as usize & mask;
        loop {
            let b = self.bucket_at(i);
            if (*b).name == 0 || (*b).name == TOMBSTONE {
                if (*b).name == 0 {
                    self.used += 1;
                }
                (*b).name = idx.index();
                ptr::write(ptr::addr_of_mut!((*b).field), Field::empty());
                return &mut (*b).field;
            }
            i = (i + 1) & mask;
        }
    }

    /// Interns `name` and returns its field, inserting an empty slot at the
    /// end of the order when missing. The flag reports whether an insertion
    /// happened. Managed maps only.
    pub fn get_or_insert(&mut self, name: &str) -> Result<(&mut Field, bool)> {
        if !self.managed {
            return Err(Error::ManagedModeViolation);
        }
        let alloc = unsafe { &*self.alloc_ptr() };
        let idx = alloc.strings().intern(alloc, name)?;
        if let Some(i) = self.find_bucket(idx) {
            return Ok((unsafe { &mut (*self.bucket_at(i)).field }, false));
        }
        self.ensure_capacity(alloc)?;
        self.slots.push(alloc, idx)?;
        Ok((unsafe { self.insert_empty(idx) }, true))
    }

    /// Registers an external object address under `name`. Unmanaged maps
    /// only; duplicate names fail with [`Error::FieldNameExists`].
    ///
    /// # Safety
    /// `value` must stay live and fixed in memory for as long as this map
    /// refers to it.
    pub unsafe fn store_ref<T: FieldType>(
        &mut self,
        name: &str,
        value: NonNull<T>,
        parent: NonNull<FieldBase>,
    ) -> Result<()> {
        if self.managed {
            return Err(Error::ManagedModeViolation);
        }
        let alloc = &*self.alloc_ptr();
        let idx = alloc.strings().intern(alloc, name)?;
        if self.find_bucket(idx).is_some() {
            return Err(Error::FieldNameExists(name.to_string()));
        }
        self.ensure_capacity(alloc)?;
        self.slots.push(alloc, idx)?;
        let field = self.insert_empty(idx);
        field.init_unmanaged(value);
        T::set_parent(value.as_ptr(), Some(parent));
        Ok(())
    }

    /// Field bound to an already-interned index, if present.
    pub(crate) fn field_by_idx(&self, idx: StrIdx) -> Option<&Field> {
        self.find_bucket(idx)
            .map(|i| unsafe { &(*self.bucket_at(i)).field })
    }

    /// Looks `name` up without interning it.
    pub fn try_get(&self, name: &str) -> Result<Option<&Field>> {
        let idx = self.alloc_ref().strings().find(name)?;
        if idx.is_none() {
            return Ok(None);
        }
        Ok(self.field_by_idx(idx))
    }

    pub fn try_get_mut(&mut self, name: &str) -> Result<Option<&mut Field>> {
        let idx = self.alloc_ref().strings().find(name)?;
        if idx.is_none() {
            return Ok(None);
        }
        Ok(self
            .find_bucket(idx)
            .map(|i| unsafe { &mut (*self.bucket_at(i)).field }))
    }

    /// Clears the named field and removes it from the order. Managed only.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if !self.managed {
            return Err(Error::ManagedModeViolation);
        }
        let alloc = unsafe { &*self.alloc_ptr() };
        let idx = alloc.strings().find(name)?;
        let bucket = if idx.is_none() { None } else { self.find_bucket(idx) };
        let Some(i) = bucket else {
            return Err(Error::FieldNotFound(name.to_string()));
        };
        unsafe {
            let b = self.bucket_at(i);
            (*b).field.clear(alloc)?;
            (*b).name = TOMBSTONE;
        }
        let pos = self
            .slots
            .iter()
            .position(|s| *s == idx)
            .expect("slot missing for mapped field");
        self.slots.remove(pos);
        Ok(())
    }

    /// Clears every field, keeping capacity. Managed only.
    pub fn clear(&mut self) -> Result<()> {
        if !self.managed {
            return Err(Error::ManagedModeViolation);
        }
        let alloc = unsafe { &*self.alloc_ptr() };
        unsafe {
            for i in 0..self.cap as usize {
                let b = self.bucket_at(i);
                if (*b).name != 0 && (*b).name != TOMBSTONE {
                    (*b).field.clear(alloc)?;
                }
                (*b).name = 0;
            }
        }
        self.used = 0;
        self.slots.clear_discard();
        Ok(())
    }

    /// Discards the field headers without running destructors. Unmanaged
    /// only.
    pub fn clear_unmanaged(&mut self) -> Result<()> {
        if self.managed {
            return Err(Error::ManagedModeViolation);
        }
        unsafe {
            for i in 0..self.cap as usize {
                let b = self.bucket_at(i);
                if (*b).name != 0 && (*b).name != TOMBSTONE {
                    (*b).field.clear_unmanaged();
                }
                (*b).name = 0;
            }
        }
        self.used = 0;
        self.slots.clear_discard();
        Ok(())
    }

    /// Releases the map's own storage. All fields must be cleared already.
    pub(crate) fn dispose(&mut self) {
        debug_assert!(self.slots.is_empty());
        let alloc = unsafe { &*self.alloc_ptr() };
        self.slots.dispose(alloc);
        let table = self.table.get();
        if !table.is_null() {
            alloc.deallocate(table as *mut u8);
        }
        self.table.set(ptr::null());
        self.cap = 0;
        self.used = 0;
    }

    /// Names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        let strings = self.alloc_ref().strings();
        self.slots.iter().map(move |idx| strings.get(*idx))
    }

    /// `(name, field)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Field)> {
        let strings = self.alloc_ref().strings();
        self.slots.iter().map(move |idx| {
            let field = self
                .field_by_idx(*idx)
                .expect("slot missing for mapped field");
            (strings.get(*idx), field)
        })
    }

    /// True when both maps bind the same name sequence, compared by string
    /// content so the maps may come from different regions.
    pub fn equal_slots(&self, other: &FieldMap) -> bool {
        if self.slots.len() != other.slots.len() {
            return false;
        }
        let a = self.alloc_ref().strings();
        let b = other.alloc_ref().strings();
        self.slots
            .iter()
            .zip(other.slots.iter())
            .all(|(x, y)| a.get(*x) == b.get(*y))
    }

    pub fn equals(&self, other: &FieldMap) -> Result<bool> {
        if self.slots.len() != other.slots.len() {
            return Ok(false);
        }
        let a = self.alloc_ref().strings();
        let b = other.alloc_ref().strings();
        for (x, y) in self.slots.iter().zip(other.slots.iter()) {
            if a.get(*x) != b.get(*y) {
                return Ok(false);
            }
            let fa = self.field_by_idx(*x).expect("slot missing for mapped field");
            let fb = other.field_by_idx(*y).expect("slot missing for mapped field");
            if !fa.equals(fb)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Managed deep copy: clears the destination, re-interns every source
    /// name into this region and deep-copies every field. A failure restores
    /// the destination to empty.
    pub(crate) fn copy_from_managed(
        &mut self,
        other: &FieldMap,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        self.clear()?;
        let alloc = unsafe { &*self.alloc_ptr() };
        let other_strings = other.alloc_ref().strings();
        for idx_other in other.slots.iter() {
            let name = other_strings.get(*idx_other);
            let src = other
                .field_by_idx(*idx_other)
                .expect("slot missing for mapped field");
            let result = (|| -> Result<()> {
                let idx = alloc.strings().intern(alloc, name)?;
                self.ensure_capacity(alloc)?;
                self.slots.push(alloc, idx)?;
                let field = unsafe { self.insert_empty(idx) };
                field.construct_copy_from(alloc, src, parent)
            })();
            if let Err(e) = result {
                // partial copies do not survive
                self.clear()?;
                return Err(Error::Frame {
                    frame: format!("copying field '{name}'"),
                    source: Box::new(e),
                });
            }
        }
        Ok(())
    }

    /// Unmanaged copy: the bound name sequences must match by content, then
    /// every field value is copied in place.
    pub(crate) fn copy_from_unmanaged(&mut self, other: &FieldMap) -> Result<()> {
        if !self.equal_slots(other) {
            return Err(Error::SlotsMismatch);
        }
        let alloc = unsafe { &*self.alloc_ptr() };
        for (x, y) in self.slots.iter().zip(other.slots.iter()) {
            let src = other.field_by_idx(*y).expect("slot missing for mapped field");
            let i = self.find_bucket(*x).expect("slot missing for mapped field");
            unsafe { (*self.bucket_at(i)).field.copy_from(alloc, src)? };
        }
        Ok(())
    }

    pub(crate) fn write_text(&self, f: &mut dyn fmt::Write) -> fmt::Result {
        f.write_str("{")?;
        for (name, field) in self.iter() {
            write!(f, "\"{name}\":")?;
            field.write_text(f)?;
            f.write_str(",")?;
        }
        f.write_str("}")
    }

    pub(crate) fn to_yaml(&self) -> Result<serde_yaml::Value> {
        let mut mapping = serde_yaml::Mapping::new();
        for (name, field) in self.iter() {
            mapping.insert(serde_yaml::Value::String(name.to_string()), field.to_yaml()?);
        }
        Ok(serde_yaml::Value::Mapping(mapping))
    }

    /// Invariant audit: slot/bucket agreement, interned names owned by the
    /// region, every field consistent, with a frame trace naming the path.
    pub(crate) fn check(
        &self,
        alloc: &SharedAlloc,
        parent: Option<NonNull<FieldBase>>,
    ) -> Result<()> {
        if !std::ptr::eq(alloc, self.alloc_ptr()) {
            return Err(Error::Frame {
                frame: "field map".to_string(),
                source: Box::new(Error::Alloc(libdd_structstore_alloc::Error::InvalidPointer {
                    addr: self.alloc_ptr() as usize,
                })),
            });
        }
        let mut occupied = 0usize;
        unsafe {
            for i in 0..self.cap as usize {
                let b = self.bucket_at(i);
                if (*b).name != 0 && (*b).name != TOMBSTONE {
                    occupied += 1;
                }
            }
        }
        if occupied != self.slots.len() {
            return Err(Error::Frame {
                frame: "field map".to_string(),
                source: Box::new(Error::SlotsMismatch),
            });
        }
        let strings = self.alloc_ref().strings();
        for idx in self.slots.iter() {
            let name = strings.get(*idx);
            let field = self
                .field_by_idx(*idx)
                .ok_or_else(|| Error::FieldNotFound(name.to_string()))?;
            // unmanaged fields point at external storage; only managed data
            // is subject to the ownership audit
            if self.managed {
                with_frame(field.check(alloc, parent), || format!("in field '{name}'"))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_region;

    fn managed_map(region: &crate::test_support::TestRegion) -> Box<FieldMap> {
        // the map itself may live on the host heap; its contents live in the
        // region; Box keeps its address stable
        let mut map = Box::new(FieldMap {
            alloc: OffsetPtr::null(),
            slots: ShrVec::new(),
            table: OffsetPtr::null(),
            cap: 0,
            used: 0,
            managed: true,
        });
        unsafe { FieldMap::init(&mut *map, region.alloc(), true) };
        map
    }

    #[test]
    fn insert_preserves_order() {
        let region = test_region(1 << 16);
        let mut map = managed_map(&region);
        for name in ["zeta", "alpha", "mid"] {
            let (field, inserted) = map.get_or_insert(name).unwrap();
            assert!(inserted);
            *field.get_or_construct::<i32>(region.alloc(), None).unwrap() = 1;
        }
        let names: Vec<&str> = map.names().collect();
        assert_eq!(names, ["zeta", "alpha", "mid"]);
        map.clear().unwrap();
        map.dispose();
    }

    #[test]
    fn reinsert_returns_existing() {
        let region = test_region(1 << 16);
        let mut map = managed_map(&region);
        {
            let (field, _) = map.get_or_insert("num").unwrap();
            *field.get_or_construct::<i32>(region.alloc(), None).unwrap() = 41;
        }
        let (field, inserted) = map.get_or_insert("num").unwrap();
        assert!(!inserted);
        assert_eq!(*field.get_ref::<i32>().unwrap(), 41);
        assert_eq!(map.len(), 1);
        map.clear().unwrap();
        map.dispose();
    }

    #[test]
    fn remove_clears_and_reorders() {
        let region = test_region(1 << 16);
        let mut map = managed_map(&region);
        let alloc = region.alloc();
        for name in ["a", "b", "c"] {
            let (field, _) = map.get_or_insert(name).unwrap();
            *field.get_or_construct::<i32>(alloc, None).unwrap() = 1;
        }
        map.remove("b").unwrap();
        let names: Vec<&str> = map.names().collect();
        assert_eq!(names, ["a", "c"]);
        assert!(matches!(
            map.remove("b"),
            Err(Error::FieldNotFound(_))
        ));
        // the tombstoned bucket is reusable
        let (field, inserted) = map.get_or_insert("b").unwrap();
        assert!(inserted);
        *field.get_or_construct::<i32>(alloc, None).unwrap() = 2;
        map.clear().unwrap();
        map.dispose();
    }

    #[test]
    fn clear_releases_field_memory() {
        let region = test_region(1 << 16);
        let mut map = managed_map(&region);
        let alloc = region.alloc();

        // steady state: names interned, capacity allocated
        let (field, _) = map.get_or_insert("x").unwrap();
        *field.get_or_construct::<i64>(alloc, None).unwrap() = 1;
        map.clear().unwrap();
        let baseline = alloc.allocated();

        for _ in 0..3 {
            let (field, _) = map.get_or_insert("x").unwrap();
            *field.get_or_construct::<i64>(alloc, None).unwrap() = 7;
            map.clear().unwrap();
            assert_eq!(alloc.allocated(), baseline);
        }
        map.dispose();
    }

    #[test]
    fn growth_keeps_fields_reachable() {
        let region = test_region(1 << 18);
        let mut map = managed_map(&region);
        let alloc = region.alloc();
        for i in 0..100 {
            let name = format!("field_{i:03}");
            let (field, _) = map.get_or_insert(&name).unwrap();
            *field.get_or_construct::<i32>(alloc, None).unwrap() = i;
        }
        for i in 0..100 {
            let name = format!("field_{i:03}");
            let field = map.try_get(&name).unwrap().unwrap();
            assert_eq!(*field.get_ref::<i32>().unwrap(), i);
        }
        assert_eq!(map.len(), 100);
        map.clear().unwrap();
        map.dispose();
    }

    #[test]
    fn unmanaged_mode_is_enforced() {
        let region = test_region(1 << 16);
        let mut map = managed_map(&region);
        assert!(matches!(
            map.clear_unmanaged(),
            Err(Error::ManagedModeViolation)
        ));
        map.clear().unwrap();
        map.dispose();
    }
}
