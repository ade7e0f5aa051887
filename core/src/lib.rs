// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Streaming parser and DoS analyzer for a Java-style object serialization
//! stream.
//!
//! The pipeline is strictly linear and single-threaded: bytes flow through
//! a [`byte_source::ByteSource`], framed by a [`block_reader::BlockReader`],
//! walked tag by tag by [`walker`], bookkept by [`analyzer::DosAnalyzer`],
//! and reduced to one [`verdict::Verdict`] by [`driver::scan`]. Diagnostics
//! flow out the other side through an [`event::EventSink`] rather than
//! being printed directly, so the same core runs unchanged whether the
//! caller is a terminal, a test, or some other embedding.

pub mod analyzer;
pub mod block_reader;
pub mod byte_source;
pub mod driver;
pub mod error;
pub mod event;
pub mod tags;
pub mod verdict;
pub mod walker;

pub use block_reader::BlockReader;
pub use byte_source::{ByteSource, PeekableReader};
pub use driver::scan;
pub use error::{ScanError, ScanResult};
pub use event::{Event, EventSink, RecordingSink};
pub use verdict::{UnsafeReason, Verdict};
