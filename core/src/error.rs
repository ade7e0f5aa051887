// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use thiserror::Error;

/// Value-typed error kinds raised while walking the object stream.
///
/// None of these are used for ordinary control flow. `UnexpectedEof` is
/// the only one the driver ever catches and downgrades to a warning.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScanError {
    #[error("corrupted stream: {0}")]
    CorruptedStream(String),

    #[error("malformed modified-UTF-8 string: {0}")]
    MalformedUtf(String),

    #[error("unexpected end of stream: {0}")]
    UnexpectedEof(String),

    #[error("invalid class descriptor flags: {0}")]
    InvalidClassFlags(String),

    #[error("cumulative array size {total} exceeds the {max} limit")]
    ArrayTooLarge { total: i64, max: i64 },

    #[error("reference graph traversal from handle {start} exceeded {max} references")]
    ReferenceTooComplex { start: i32, max: u64 },

    #[error("block-data mode switch with unconsumed bytes: {0}")]
    BlockStateViolation(String),
}

impl ScanError {
    /// Whether this error is survivable: the walk stops but the reference
    /// graph analysis still runs over whatever was parsed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ScanError::UnexpectedEof(_))
    }
}

pub type ScanResult<T> = Result<T, ScanError>;
