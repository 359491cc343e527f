// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Alloc(#[from] libdd_structstore_alloc::Error),

    #[error("no type registered for hash {type_hash:#x}")]
    UnknownType { type_hash: u64 },

    #[error("field accessed with wrong type: expected hash {expected:#x}, found {actual:#x}")]
    TypeMismatch { expected: u64, actual: u64 },

    #[error("type already registered: {0}")]
    TypeAlreadyRegistered(&'static str),

    #[error("type hash collision between '{name}' and '{existing}'")]
    TypeHashCollision {
        name: &'static str,
        existing: String,
    },

    #[error("field name already exists: {0}")]
    FieldNameExists(String),

    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("matrix data set to the same pointer with a different shape")]
    MatrixShapeMismatch,

    #[error("invalid matrix shape")]
    MatrixInvalidShape,

    #[error("operation not supported in this managed mode")]
    ManagedModeViolation,

    #[error("copying between stores with different field layouts")]
    SlotsMismatch,

    #[error("shared segment exists but is not initialized yet")]
    NotReady,

    #[error("shared segment has been invalidated")]
    SegmentInvalidated,

    #[error("serialization format not supported for type '{0}'")]
    UnsupportedSerialization(&'static str),

    #[error("invalid parent reference in field of type '{type_name}'")]
    ParentMismatch { type_name: &'static str },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("{frame}: {source}")]
    Frame {
        frame: String,
        #[source]
        source: Box<Error>,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Prefixes an error with a trace frame so failures deep inside nested
/// stores and lists carry their path to the caller.
pub(crate) fn with_frame<T>(r: Result<T>, frame: impl FnOnce() -> String) -> Result<T> {
    r.map_err(|e| Error::Frame {
        frame: frame(),
        source: Box::new(e),
    })
}
