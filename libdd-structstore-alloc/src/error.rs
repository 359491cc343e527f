// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// A live allocation found by the teardown walk, reported by region offset so
/// the message is meaningful in any mapping of the region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeakedBlock {
    /// Byte offset of the block payload from the start of the managed buffer.
    pub offset: usize,
    /// Allocatable size of the block in bytes.
    pub size: u32,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("insufficient space in region, currently allocated: {allocated}, requested: {requested}")]
    OutOfRegionMemory { allocated: usize, requested: usize },

    #[error("pointer {addr:#x} is not inside the managed region")]
    InvalidPointer { addr: usize },

    #[error("region teardown found {} leaked block(s)", .0.len())]
    LeakedBlocks(Vec<LeakedBlock>),

    #[error("trying to acquire read lock while current thread holds the write lock")]
    LockRecursion,
}

pub type Result<T> = std::result::Result<T, Error>;
