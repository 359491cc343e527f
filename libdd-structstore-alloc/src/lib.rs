// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded-region allocator and position-independent primitives.
//!
//! Everything in this crate operates on a single contiguous byte region that
//! may be mapped into several address spaces at *different* base addresses.
//! The rules that make that work:
//!
//! - Every intra-region link is an [`OffsetPtr`]: a self-relative offset, not
//!   an absolute pointer.
//! - All allocations come from the region's own [`SharedAlloc`], a segregated
//!   free-list allocator ([`mini_malloc`]) living at the start of the region.
//! - Region-resident values are constructed in place and never moved by value
//!   once they hold a non-null `OffsetPtr`.
//!
//! The crate has no global state besides the process-local
//! [`static_alloc`](shared_alloc::static_alloc) heap, which backs stores that
//! do not live in shared memory and must never be referenced from a region.

pub mod error;
pub mod lock;
pub mod mini_malloc;
pub mod offset_ptr;
pub mod shared_alloc;
pub mod strings;
pub mod vec;

pub use error::{Error, LeakedBlock, Result};
pub use lock::{ReadGuard, SpinMutex, WriteGuard};
pub use offset_ptr::OffsetPtr;
pub use shared_alloc::{static_alloc, SharedAlloc, ALIGN};
pub use strings::{StrIdx, StringStorage};
pub use vec::{Relocate, ShrString, ShrVec};
