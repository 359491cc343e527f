// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed, self-describing key-value store inside a shareable memory region.
//!
//! A [`StructStore`] holds an ordered set of named fields whose values are
//! scalars, strings, lists, dense numeric matrices or nested stores. Every
//! value, and every container holding one, is allocated from the region's
//! own allocator and linked with self-relative pointers, so a region mapped
//! into another process at a different base address works unchanged.
//!
//! - [`StructStoreShared`] creates or attaches named shared segments with an
//!   atomic readiness handshake, usage counting and coordinated cleanup.
//! - [`LocalStore`] backs a store with the process-local allocator when no
//!   sharing is needed.
//! - Field values are type-erased behind a 64-bit name hash; the process
//!   [`typing`] registry supplies construction, comparison, serialization
//!   and audit behavior per type, and user types plug in through
//!   [`typing::FieldType`].
//!
//! A region is only valid between processes with the same pointer width and
//! endianness, linking the same type registry.

pub mod containers;
pub mod error;
pub mod field;
pub mod fieldmap;
pub mod shared;
pub mod store;
pub mod typing;

pub use containers::{List, ListReadGuard, ListWriteGuard, Matrix, Str, MATRIX_MAX_DIMS};
pub use error::{Error, Result};
pub use field::{Field, FieldBase, FieldValue};
pub use fieldmap::FieldMap;
pub use shared::{CleanupMode, OpenOptions, StructStoreShared};
pub use store::{LocalStore, StoreReadGuard, StoreWriteGuard, StructStore};
pub use typing::{register_type, type_hash, FieldType, TypeInfo};

// re-exported so embedders can drive the allocator layer directly
pub use libdd_structstore_alloc as alloc;

#[cfg(test)]
pub(crate) mod test_support {
    use libdd_structstore_alloc::{SharedAlloc, ALIGN};

    /// A region in process memory: `[SharedAlloc header][buffer]` inside an
    /// 8-aligned heap allocation.
    pub(crate) struct TestRegion {
        buf: Vec<u64>,
    }

    impl TestRegion {
        pub(crate) fn alloc(&self) -> &SharedAlloc {
            unsafe { &*(self.buf.as_ptr() as *const SharedAlloc) }
        }
    }

    pub(crate) fn test_region(size: usize) -> TestRegion {
        let words = size / 8;
        let mut buf = vec![0u64; words];
        let base = buf.as_mut_ptr() as *mut u8;
        let header = (core::mem::size_of::<SharedAlloc>() + ALIGN - 1) & !(ALIGN - 1);
        unsafe {
            SharedAlloc::init(base as *mut SharedAlloc, base.add(header), words * 8 - header)
                .expect("test region init");
        }
        TestRegion { buf }
    }
}
