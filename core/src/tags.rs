// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Wire constants for the object-stream grammar.
//!
//! These values are part of the external contract and must not drift from
//! the numbers below: a scanner that disagrees with the writer on a
//! single tag value silently desyncs for the rest of the stream.

pub const STREAM_MAGIC: u16 = 0xACED;
pub const STREAM_VERSION: u16 = 0x0005;

pub const TC_BASE: u8 = 0x70;
pub const TC_NULL: u8 = 0x70;
pub const TC_REFERENCE: u8 = 0x71;
pub const TC_CLASSDESC: u8 = 0x72;
pub const TC_OBJECT: u8 = 0x73;
pub const TC_STRING: u8 = 0x74;
pub const TC_ARRAY: u8 = 0x75;
pub const TC_CLASS: u8 = 0x76;
pub const TC_BLOCKDATA: u8 = 0x77;
pub const TC_ENDBLOCKDATA: u8 = 0x78;
pub const TC_RESET: u8 = 0x79;
pub const TC_BLOCKDATALONG: u8 = 0x7A;
pub const TC_EXCEPTION: u8 = 0x7B;
pub const TC_LONGSTRING: u8 = 0x7C;
pub const TC_PROXYCLASSDESC: u8 = 0x7D;
pub const TC_ENUM: u8 = 0x7E;
pub const TC_MAX: u8 = 0x7E;

/// Wire handles are offset from this value; handle-table indices are
/// `wire_handle - BASE_WIRE_HANDLE`.
pub const BASE_WIRE_HANDLE: i32 = 0x7E_0000;

pub const SC_WRITE_METHOD: u8 = 0x01;
pub const SC_SERIALIZABLE: u8 = 0x02;
pub const SC_EXTERNALIZABLE: u8 = 0x04;
pub const SC_BLOCK_DATA: u8 = 0x08;
pub const SC_ENUM: u8 = 0x10;

pub const ARRAY_SIZE_MAX: i64 = 65536;
pub const REFERENCE_MAX: u64 = 32768;

/// The class label this scanner synthesizes for string handles; strings
/// never carry an on-wire class descriptor of their own.
pub const STRING_CLASS_LABEL: &str = "java.lang.String";
