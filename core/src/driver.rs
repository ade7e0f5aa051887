// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Orchestration (component F).
//!
//! Wires the byte source through the block reader and the grammar walker,
//! runs the two DoS checks, and reduces everything to one [`Verdict`].

use crate::block_reader::BlockReader;
use crate::byte_source::{ByteSource, PeekableReader};
use crate::error::{ScanError, ScanResult};
use crate::event::EventSink;
use crate::verdict::{UnsafeReason, Verdict};
use crate::walker;

/// Scans a byte source for DoS-prone serialization shapes, emitting
/// diagnostics through `sink` and returning a single verdict.
///
/// `UnexpectedEof` inside the walk is not propagated: the walk stops, a
/// warning is emitted, and the reference-graph check still runs over
/// whatever handles and edges were recorded before the stream broke off.
/// `ArrayTooLarge` and `ReferenceTooComplex` are not propagated either;
/// both short-circuit straight to `Verdict::Unsafe`. Anything else
/// (a bad stream header, malformed UTF-8, an inconsistent class
/// descriptor) is a genuine parse failure and is returned as an error.
pub fn scan<R: std::io::Read, Sink: EventSink>(source: R, sink: &mut Sink) -> ScanResult<Verdict> {
    let mut reader = BlockReader::new(PeekableReader::new(source));
    scan_with_reader(&mut reader, sink)
}

fn scan_with_reader<S: ByteSource, Sink: EventSink>(
    reader: &mut BlockReader<S>,
    sink: &mut Sink,
) -> ScanResult<Verdict> {
    let outcome = match walker::walk(reader, sink) {
        Ok(outcome) => outcome,
        Err(ScanError::ArrayTooLarge { .. }) => {
            return Ok(finish(sink, Verdict::Unsafe {
                reason: UnsafeReason::ArrayTooLarge,
            }))
        }
        Err(e) => return Err(e),
    };

    let verdict = match outcome.analyzer.check_reference_graph(
        outcome.handle_table.len(),
        &outcome.edges,
        sink,
    ) {
        Ok(()) => Verdict::Safe,
        Err(ScanError::ReferenceTooComplex { .. }) => Verdict::Unsafe {
            reason: UnsafeReason::ReferenceTooComplex,
        },
        Err(e) => return Err(e),
    };
    Ok(finish(sink, verdict))
}

fn finish<Sink: EventSink>(sink: &mut Sink, verdict: Verdict) -> Verdict {
    sink.verdict(verdict);
    verdict
}
