// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dense, append-only string interning table.
//!
//! Strings are stored exactly once per region; everything else refers to them
//! through a small integer index ([`StrIdx`]). Index 0 is reserved for the
//! none/empty entry, so 0 doubles as the vacant marker of the open-hash index
//! table. Once assigned, an index never changes and the content behind it is
//! immutable for the lifetime of the region.
//!
//! Writes are serialized by the embedded write lock; [`find`] only takes the
//! read lock. The content hash is FNV-1a, deterministic so that every process
//! mapping the region probes identically.
//!
//! [`find`]: StringStorage::find

use crate::error::Result;
use crate::lock::SpinMutex;
use crate::shared_alloc::SharedAlloc;
use crate::vec::{Relocate, ShrString, ShrVec};
use core::ptr;

/// Index of an interned string; 0 means "none".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct StrIdx(u32);

impl StrIdx {
    pub const NONE: StrIdx = StrIdx(0);

    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }

    pub(crate) fn from_raw(raw: u32) -> StrIdx {
        StrIdx(raw)
    }
}

unsafe impl Relocate for StrIdx {
    #[inline]
    unsafe fn relocate(src: *mut Self, dst: *mut Self) {
        ptr::copy_nonoverlapping(src, dst, 1);
    }
}

#[repr(C)]
pub struct StringStorage {
    mutex: SpinMutex,
    // index -> string; [0] is the reserved none entry
    data: ShrVec<ShrString>,
    // open hash of indices, power-of-two capacity, 0 vacant
    table: ShrVec<u32>,
}

impl StringStorage {
    /// Places a fresh table at `this` and reserves index 0.
    ///
    /// # Safety
    /// `this` must point to uninitialized region memory of sufficient size;
    /// the storage must be torn down via [`dispose`](StringStorage::dispose).
    pub(crate) unsafe fn init(this: *mut StringStorage, alloc: &SharedAlloc) -> Result<()> {
        ptr::write(ptr::addr_of_mut!((*this).mutex), SpinMutex::new());
        ptr::write(ptr::addr_of_mut!((*this).data), ShrVec::new());
        ptr::write(ptr::addr_of_mut!((*this).table), ShrVec::new());
        (*this).data.push(alloc, ShrString::new())?;
        Ok(())
    }

    fn hash_str(s: &str) -> u64 {
        let mut h: u64 = 0xcbf29ce484222325;
        for &b in s.as_bytes() {
            h ^= b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
        h
    }

    /// Number of entries, including the reserved none entry.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// Interns `s`, returning the existing index when present.
    pub fn intern(&self, alloc: &SharedAlloc, s: &str) -> Result<StrIdx> {
        let guard = self.mutex.write_lock();
        // SAFETY: the write lock gives this thread exclusive mutable access.
        let result = unsafe {
            #[allow(invalid_reference_casting)]
            let this = &mut *(self as *const StringStorage as *mut StringStorage);
            this.intern_locked(alloc, s)
        };
        guard.unlock();
        result
    }

    unsafe fn intern_locked(&mut self, alloc: &SharedAlloc, s: &str) -> Result<StrIdx> {
        let found = self.probe(s);
        if !found.is_none() {
            return Ok(found);
        }
        let occupied = self.data.len() as u32 - 1;
        if (occupied + 1) * 4 > self.table.len() as u32 * 3 {
            self.grow_table(alloc)?;
        }
        let idx = self.data.len() as u32;
        let slot = self.data.push(alloc, ShrString::new())?;
        if let Err(e) = slot.assign(alloc, s) {
            self.data.remove(idx as usize);
            return Err(e);
        }
        self.table_insert(Self::hash_str(s), idx);
        Ok(StrIdx(idx))
    }

    /// Index of `s` if it has been interned, [`StrIdx::NONE`] otherwise.
    pub fn find(&self, s: &str) -> Result<StrIdx> {
        let guard = self.mutex.read_lock()?;
        let idx = self.probe(s);
        guard.unlock();
        Ok(idx)
    }

    fn probe(&self, s: &str) -> StrIdx {
        if self.table.is_empty() {
            return StrIdx::NONE;
        }
        let mask = self.table.len() - 1;
        let mut i = Self::hash_str(s) as usize & mask;
        loop {
            let entry = self.table.as_slice()[i];
            if entry == 0 {
                return StrIdx::NONE;
            }
            if self.data.as_slice()[entry as usize].as_str() == s {
                return StrIdx(entry);
            }
            i = (i + 1) & mask;
        }
    }

    fn table_insert(&mut self, hash: u64, idx: u32) {
        let mask = self.table.len() - 1;
        let mut i = hash as usize & mask;
        let slots = self.table.as_mut_slice();
        while slots[i] != 0 {
            i = (i + 1) & mask;
        }
        slots[i] = idx;
    }

    fn grow_table(&mut self, alloc: &SharedAlloc) -> Result<()> {
        let new_cap = (self.table.len() * 2).max(16);
        // the region table cannot be moved by value; rehash through a
        // process-local scratch copy of the entries
        let entries: Vec<u32> = self
            .table
            .iter()
            .copied()
            .filter(|&e| e != 0)
            .collect();
        self.table.reset_zeroed(alloc, new_cap)?;
        for entry in entries {
            let hash = Self::hash_str(self.data.as_slice()[entry as usize].as_str());
            self.table_insert(hash, entry);
        }
        Ok(())
    }

    /// Content behind an index. Callers must not race a concurrent `intern`
    /// (in practice the owning container's lock is held); out-of-range
    /// indices resolve to the empty string.
    pub fn get(&self, idx: StrIdx) -> &str {
        match self.data.get(idx.index() as usize) {
            Some(s) => s.as_str(),
            None => "",
        }
    }

    pub(crate) fn get_raw(&self, idx: StrIdx) -> Option<&ShrString> {
        self.data.get(idx.index() as usize)
    }

    /// Releases every buffer owned by the table.
    ///
    /// # Safety
    /// No index derived from this storage may be used afterwards.
    pub(crate) unsafe fn dispose(&mut self, alloc: &SharedAlloc) {
        for s in self.data.iter_mut() {
            s.dispose(alloc);
        }
        self.data.dispose(alloc);
        self.table.dispose(alloc);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_alloc::tests::test_region;

    #[test]
    fn intern_and_get() {
        let region = test_region(1 << 16);
        let alloc = region.alloc();
        let strings = alloc.strings();
        let base = strings.len();

        let idx = strings.intern(alloc, "hello").unwrap();
        assert!(!idx.is_none());
        assert_eq!(strings.get(idx), "hello");
        assert_eq!(strings.len(), base + 1);
    }

    #[test]
    fn intern_deduplicates() {
        let region = test_region(1 << 16);
        let alloc = region.alloc();
        let strings = alloc.strings();

        let a = strings.intern(alloc, "hello").unwrap();
        let b = strings.intern(alloc, "hello").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn find_without_interning() {
        let region = test_region(1 << 16);
        let alloc = region.alloc();
        let strings = alloc.strings();

        assert!(strings.find("missing").unwrap().is_none());
        let idx = strings.intern(alloc, "present").unwrap();
        assert_eq!(strings.find("present").unwrap(), idx);
    }

    #[test]
    fn index_zero_is_reserved_none() {
        let region = test_region(1 << 16);
        let alloc = region.alloc();
        let strings = alloc.strings();

        assert_eq!(strings.get(StrIdx::NONE), "");
        // the empty string interns to a fresh index, not to the reserved slot
        let idx = strings.intern(alloc, "").unwrap();
        assert!(!idx.is_none());
        assert_eq!(strings.get(idx), "");
    }

    #[test]
    fn indices_are_stable_across_growth() {
        let region = test_region(1 << 18);
        let alloc = region.alloc();
        let strings = alloc.strings();

        let mut indices = Vec::new();
        for i in 0..300 {
            indices.push(strings.intern(alloc, &format!("string_{i:04}")).unwrap());
        }
        for (i, idx) in indices.iter().enumerate() {
            assert_eq!(strings.get(*idx), format!("string_{i:04}"));
            assert_eq!(strings.intern(alloc, &format!("string_{i:04}")).unwrap(), *idx);
        }
    }

    #[test]
    fn out_of_range_resolves_empty() {
        let region = test_region(1 << 16);
        let alloc = region.alloc();
        assert_eq!(alloc.strings().get(StrIdx::from_raw(9999)), "");
    }
}
