// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Grammar walker (component C).
//!
//! Drives a [`BlockReader`] tag by tag, assigning handles in writer order,
//! building the reference-edge graph, and feeding every declared length
//! into the [`DosAnalyzer`]. It is deliberately forgiving: an unrecognized
//! tag is consumed and skipped rather than treated as fatal, and any
//! `UnexpectedEof` simply ends the walk early so the analyzer can still run
//! over whatever was parsed before the stream broke off. This is a scanner
//! with bookkeeping, not a deserializer. It never reconstructs declared
//! instance fields, only the handful of structures that can make a stream
//! expensive to deserialize: class descriptors, arrays, strings, objects,
//! and back-references.

use std::collections::{HashMap, HashSet};

use crate::analyzer::DosAnalyzer;
use crate::block_reader::BlockReader;
use crate::byte_source::ByteSource;
use crate::error::{ScanError, ScanResult};
use crate::event::EventSink;
use crate::tags;

/// Everything the walk produced: the handle table, the reference-edge
/// graph, and the analyzer's running array-size total. The driver hands
/// this to [`DosAnalyzer::check_reference_graph`] once the walk is done.
pub struct WalkOutcome {
    pub handle_table: Vec<Option<String>>,
    pub edges: HashMap<i32, HashSet<i32>>,
    pub analyzer: DosAnalyzer,
}

/// Walks the full stream: header check, then dispatch loop until end of
/// stream or an unrecoverable error. `UnexpectedEof` is swallowed here (a
/// warning is pushed to `sink`) rather than propagated, matching the
/// driver's "keep the bookkeeping we have" policy, so the caller only ever
/// sees fatal errors.
pub fn walk<R: ByteSource, Sink: EventSink>(
    reader: &mut BlockReader<R>,
    sink: &mut Sink,
) -> ScanResult<WalkOutcome> {
    let mut walker = GrammarWalker::new();
    match walker.check_header(reader) {
        Ok(()) => {}
        Err(e) if e.is_recoverable() => {
            sink.warn(format!("stream ended before the header completed: {e}"));
            return Ok(walker.into_outcome());
        }
        Err(e) => return Err(e),
    }
    loop {
        match walker.dispatch_one(reader, sink) {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) if e.is_recoverable() => {
                sink.warn(format!("walk ended early: {e}"));
                break;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(walker.into_outcome())
}

struct GrammarWalker {
    handle_table: Vec<Option<String>>,
    edges: HashMap<i32, HashSet<i32>>,
    parent_stack: Vec<i32>,
    now_object_number: i32,
    analyzer: DosAnalyzer,
}

impl GrammarWalker {
    fn new() -> Self {
        Self {
            handle_table: Vec::new(),
            edges: HashMap::new(),
            parent_stack: Vec::new(),
            now_object_number: -1,
            analyzer: DosAnalyzer::new(),
        }
    }

    fn into_outcome(self) -> WalkOutcome {
        WalkOutcome {
            handle_table: self.handle_table,
            edges: self.edges,
            analyzer: self.analyzer,
        }
    }

    fn check_header<R: ByteSource>(&mut self, reader: &mut BlockReader<R>) -> ScanResult<()> {
        let magic = reader.read_u16()?;
        let version = reader.read_u16()?;
        if magic != tags::STREAM_MAGIC || version != tags::STREAM_VERSION {
            return Err(ScanError::CorruptedStream(format!(
                "bad stream header: magic={magic:#06x} version={version:#06x}"
            )));
        }
        Ok(())
    }

    fn assign_handle(&mut self, label: Option<String>) -> i32 {
        self.now_object_number += 1;
        self.handle_table.push(label);
        self.now_object_number
    }

    fn add_edge(&mut self, source: i32, target: i32) {
        self.edges.entry(target).or_default().insert(source);
    }

    /// The handle a back-reference is currently "inside of": the nearest
    /// enclosing block-data frame, or else whatever handle was most
    /// recently assigned.
    fn current_handle(&self) -> i32 {
        self.parent_stack
            .last()
            .copied()
            .unwrap_or(self.now_object_number)
    }

    /// Consumes and dispatches exactly one tag. Returns `Ok(false)` at end
    /// of stream, `Ok(true)` otherwise.
    fn dispatch_one<R: ByteSource, Sink: EventSink>(
        &mut self,
        reader: &mut BlockReader<R>,
        sink: &mut Sink,
    ) -> ScanResult<bool> {
        let Some(tag) = reader.peek_tag()? else {
            return Ok(false);
        };
        match tag {
            tags::TC_NULL => {
                reader.read_tag()?;
            }
            tags::TC_ARRAY => self.parse_array(reader, sink)?,
            tags::TC_CLASSDESC | tags::TC_PROXYCLASSDESC => {
                self.parse_class_descriptor(reader, sink, tag)?;
            }
            tags::TC_STRING | tags::TC_LONGSTRING => self.parse_string(reader, tag)?,
            tags::TC_OBJECT => self.parse_object(reader, sink)?,
            tags::TC_REFERENCE => self.parse_reference(reader)?,
            tags::TC_BLOCKDATA | tags::TC_BLOCKDATALONG => {
                self.parse_top_level_block(reader, tag)?
            }
            tags::TC_ENDBLOCKDATA => {
                reader.read_tag()?;
                self.parent_stack.pop();
            }
            _ => {
                // Graceful resync: an unrecognized tag is swallowed one
                // byte at a time rather than treated as fatal.
                reader.read_tag()?;
            }
        }
        Ok(true)
    }

    fn parse_object<R: ByteSource, Sink: EventSink>(
        &mut self,
        reader: &mut BlockReader<R>,
        sink: &mut Sink,
    ) -> ScanResult<()> {
        reader.read_tag()?;
        let class_tag = reader
            .peek_tag()?
            .ok_or_else(|| ScanError::UnexpectedEof("object class descriptor".into()))?;
        match class_tag {
            tags::TC_CLASSDESC | tags::TC_PROXYCLASSDESC => {
                self.parse_class_descriptor(reader, sink, class_tag)?;
            }
            tags::TC_REFERENCE => {
                self.parse_reference(reader)?;
            }
            _ => {
                reader.read_tag()?;
            }
        }
        let handle = self.assign_handle(None);
        if let Some(&parent) = self.parent_stack.last() {
            // the enclosing frame holds a reference to the nested object
            self.add_edge(parent, handle);
        }
        Ok(())
    }

    fn parse_array<R: ByteSource, Sink: EventSink>(
        &mut self,
        reader: &mut BlockReader<R>,
        sink: &mut Sink,
    ) -> ScanResult<()> {
        reader.read_tag()?;
        let class_tag = reader
            .peek_tag()?
            .ok_or_else(|| ScanError::UnexpectedEof("array class descriptor".into()))?;
        let name = match class_tag {
            tags::TC_CLASSDESC | tags::TC_PROXYCLASSDESC => {
                Some(self.parse_class_descriptor(reader, sink, class_tag)?)
            }
            tags::TC_REFERENCE => self.read_class_ref(reader)?,
            other => {
                return Err(ScanError::CorruptedStream(format!(
                    "unexpected tag {other:#x} for array class descriptor"
                )))
            }
        };
        let handle = self.assign_handle(name);
        if let Some(&parent) = self.parent_stack.last() {
            self.add_edge(parent, handle);
        }
        let length = reader.read_i32()?;
        self.analyzer.record_array_length(length, sink)?;
        let class_name = self.handle_table[handle as usize].clone().unwrap_or_default();
        self.read_array_elements(reader, sink, handle, &class_name, length)
    }

    /// Skips primitive-typed array bodies byte-for-byte; recurses through
    /// the ordinary dispatch loop, one value per element and the array's
    /// own handle pushed as parent, for reference-typed bodies (including
    /// nested arrays) so that reference amplification through an array of
    /// shared objects is still visible to the reference-graph check.
    fn read_array_elements<R: ByteSource, Sink: EventSink>(
        &mut self,
        reader: &mut BlockReader<R>,
        sink: &mut Sink,
        handle: i32,
        class_name: &str,
        length: i32,
    ) -> ScanResult<()> {
        if length <= 0 {
            return Ok(());
        }
        let elem = class_name.trim_start_matches('[');
        match elem.chars().next() {
            Some('L') | Some('[') => {
                self.parent_stack.push(handle);
                for _ in 0..length {
                    if !self.dispatch_one(reader, sink)? {
                        self.parent_stack.pop();
                        return Err(ScanError::UnexpectedEof("array element".into()));
                    }
                }
                self.parent_stack.pop();
            }
            Some(code) => {
                let size = primitive_size(code).ok_or_else(|| {
                    ScanError::CorruptedStream(format!("unknown array element type code '{code}'"))
                })?;
                let total = i64::from(length) * i64::from(size);
                reader.skip_raw(usize::try_from(total).unwrap_or(0))?;
            }
            None => {
                // Element shape unknown (an unlabeled class reference);
                // nothing further can be safely consumed as elements.
            }
        }
        Ok(())
    }

    fn parse_string<R: ByteSource>(&mut self, reader: &mut BlockReader<R>, tag: u8) -> ScanResult<()> {
        reader.read_tag()?;
        self.assign_handle(Some(tags::STRING_CLASS_LABEL.to_string()));
        if tag == tags::TC_STRING {
            reader.read_utf()?;
        } else {
            reader.read_long_utf()?;
        }
        Ok(())
    }

    fn parse_reference<R: ByteSource>(&mut self, reader: &mut BlockReader<R>) -> ScanResult<()> {
        reader.read_tag()?;
        let wire_handle = reader.read_i32()?;
        let index = wire_handle - tags::BASE_WIRE_HANDLE;
        if index < 0 || index as usize >= self.handle_table.len() {
            return Err(ScanError::CorruptedStream(format!(
                "back-reference to out-of-range handle {wire_handle:#x}"
            )));
        }
        let current = self.current_handle();
        if current >= 0 {
            // the current context holds a reference to the resolved handle
            self.add_edge(current, index);
            if self.handle_table[current as usize].is_none() {
                self.handle_table[current as usize] = self.handle_table[index as usize].clone();
            }
        }
        Ok(())
    }

    /// Reads and validates a class-descriptor reference (used for shared
    /// superclass descriptors and array element types), returning the
    /// referenced label without recording a reference-graph edge: these
    /// point at type metadata, not at values that can themselves fan out,
    /// so they are outside the DoS-relevant part of the graph.
    fn read_class_ref<R: ByteSource>(
        &mut self,
        reader: &mut BlockReader<R>,
    ) -> ScanResult<Option<String>> {
        reader.read_tag()?;
        let wire_handle = reader.read_i32()?;
        let index = wire_handle - tags::BASE_WIRE_HANDLE;
        if index < 0 || index as usize >= self.handle_table.len() {
            return Err(ScanError::CorruptedStream(format!(
                "out-of-range class-descriptor reference {wire_handle:#x}"
            )));
        }
        Ok(self.handle_table[index as usize].clone())
    }

    fn parse_top_level_block<R: ByteSource>(
        &mut self,
        reader: &mut BlockReader<R>,
        tag: u8,
    ) -> ScanResult<()> {
        reader.exit_block_mode()?;
        reader.read_tag()?;
        let len: i64 = if tag == tags::TC_BLOCKDATA {
            i64::from(reader.read_u8()?)
        } else {
            let raw = reader.read_i32()?;
            if raw < 0 {
                return Err(ScanError::CorruptedStream(
                    "TC_BLOCKDATALONG length is negative".into(),
                ));
            }
            i64::from(raw)
        };
        reader.skip_raw(usize::try_from(len).unwrap_or(0))?;
        self.parent_stack.push(self.now_object_number);
        Ok(())
    }

    fn parse_class_descriptor<R: ByteSource, Sink: EventSink>(
        &mut self,
        reader: &mut BlockReader<R>,
        sink: &mut Sink,
        tag: u8,
    ) -> ScanResult<String> {
        reader.read_tag()?;
        // Reserve the handle before recursing into fields/superclass so a
        // self-referential class (a field whose type is the class itself)
        // can back-reference this descriptor while it's still being read.
        let handle = self.assign_handle(None);
        if tag == tags::TC_PROXYCLASSDESC {
            let num_ifaces = reader.read_i32()?;
            self.analyzer.record_array_length(num_ifaces, sink)?;
            for _ in 0..num_ifaces.max(0) {
                reader.read_utf()?;
            }
        }
        let name = self.parse_descriptor_tail(reader, sink)?;
        self.handle_table[handle as usize] = Some(name.clone());
        Ok(name)
    }

    fn parse_descriptor_tail<R: ByteSource, Sink: EventSink>(
        &mut self,
        reader: &mut BlockReader<R>,
        sink: &mut Sink,
    ) -> ScanResult<String> {
        let name = reader.read_utf()?;
        let serial_version_uid = reader.read_i64()?;
        let flags = reader.read_i8()? as u8;
        let num_fields = reader.read_i16()?;

        let externalizable = flags & tags::SC_EXTERNALIZABLE != 0;
        let serializable = flags & tags::SC_SERIALIZABLE != 0;
        if externalizable && serializable {
            return Err(ScanError::InvalidClassFlags(format!(
                "{name}: SC_EXTERNALIZABLE and SC_SERIALIZABLE are mutually exclusive"
            )));
        }
        let is_enum = flags & tags::SC_ENUM != 0;
        if is_enum && (serial_version_uid != 0 || num_fields != 0) {
            return Err(ScanError::InvalidClassFlags(format!(
                "{name}: SC_ENUM classes must have zero serialVersionUID and zero fields"
            )));
        }

        tracing::debug!(%name, num_fields, flags, "parsed class descriptor");
        sink.descriptor(&name, serial_version_uid, num_fields);

        for _ in 0..num_fields.max(0) {
            let typecode = reader.read_i8()? as u8 as char;
            reader.read_utf()?; // field name, unused
            if typecode == 'L' || typecode == '[' {
                self.parse_type_string(reader)?;
            }
        }

        self.skip_custom_data(reader)?;
        self.parse_super_class_descriptor(reader, sink)?;
        Ok(name)
    }

    /// A field's type string: an inline `TC_STRING`/`TC_LONGSTRING`, a
    /// `TC_REFERENCE` to one already seen, or `TC_NULL`.
    fn parse_type_string<R: ByteSource>(&mut self, reader: &mut BlockReader<R>) -> ScanResult<()> {
        let tag = reader
            .peek_tag()?
            .ok_or_else(|| ScanError::UnexpectedEof("field type string".into()))?;
        match tag {
            tags::TC_STRING | tags::TC_LONGSTRING => self.parse_string(reader, tag)?,
            tags::TC_REFERENCE => self.parse_reference(reader)?,
            tags::TC_NULL => {
                reader.read_tag()?;
            }
            other => {
                return Err(ScanError::CorruptedStream(format!(
                    "unexpected tag {other:#x} in field type string position"
                )))
            }
        }
        Ok(())
    }

    fn parse_super_class_descriptor<R: ByteSource, Sink: EventSink>(
        &mut self,
        reader: &mut BlockReader<R>,
        sink: &mut Sink,
    ) -> ScanResult<()> {
        let tag = reader
            .peek_tag()?
            .ok_or_else(|| ScanError::UnexpectedEof("superclass descriptor".into()))?;
        match tag {
            tags::TC_CLASSDESC | tags::TC_PROXYCLASSDESC => {
                self.parse_class_descriptor(reader, sink, tag)?;
                Ok(())
            }
            tags::TC_NULL => {
                reader.read_tag()?;
                Ok(())
            }
            tags::TC_REFERENCE => self.read_class_ref(reader).map(|_| ()),
            other => Err(ScanError::CorruptedStream(format!(
                "unexpected tag {other:#x} for superclass descriptor"
            ))),
        }
    }

    /// Consumes optional block-data custom-data sections terminated by
    /// `TC_ENDBLOCKDATA`. Any other tag is left unconsumed.
    fn skip_custom_data<R: ByteSource>(&mut self, reader: &mut BlockReader<R>) -> ScanResult<()> {
        loop {
            match reader.peek_tag()? {
                Some(tags::TC_BLOCKDATA) | Some(tags::TC_BLOCKDATALONG) => {
                    reader.enter_block_mode();
                    reader.skip_to_end_of_blocks()?;
                    reader.exit_block_mode()?;
                }
                Some(tags::TC_ENDBLOCKDATA) => {
                    reader.read_tag()?;
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }
}

fn primitive_size(code: char) -> Option<u8> {
    match code {
        'B' | 'Z' => Some(1),
        'C' | 'S' => Some(2),
        'F' | 'I' => Some(4),
        'D' | 'J' => Some(8),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_reader::BlockReader;
    use crate::byte_source::PeekableReader;
    use crate::event::RecordingSink;

    fn walk_bytes(bytes: &[u8]) -> ScanResult<(WalkOutcome, RecordingSink)> {
        let mut reader = BlockReader::new(PeekableReader::new(bytes));
        let mut sink = RecordingSink::new();
        let outcome = walk(&mut reader, &mut sink)?;
        Ok((outcome, sink))
    }

    fn header() -> Vec<u8> {
        vec![0xAC, 0xED, 0x00, 0x05]
    }

    #[test]
    fn header_only_stream_is_empty_and_safe() {
        let (outcome, _) = walk_bytes(&header()).unwrap();
        assert!(outcome.handle_table.is_empty());
        assert_eq!(outcome.analyzer.total_array_size(), 0);
    }

    #[test]
    fn bad_magic_is_corrupted_stream() {
        let bytes = [0x00, 0x00, 0x00, 0x05];
        let err = walk_bytes(&bytes).unwrap_err();
        assert!(matches!(err, ScanError::CorruptedStream(_)));
    }

    #[test]
    fn truncated_header_ends_walk_without_error() {
        let (outcome, _) = walk_bytes(&[0xAC, 0xED]).unwrap();
        assert!(outcome.handle_table.is_empty());
    }

    #[test]
    fn single_string_gets_handle_zero() {
        let mut bytes = header();
        bytes.push(tags::TC_STRING);
        bytes.extend_from_slice(&[0x00, 0x03]);
        bytes.extend_from_slice(b"foo");
        let (outcome, _) = walk_bytes(&bytes).unwrap();
        assert_eq!(outcome.handle_table.len(), 1);
        assert_eq!(
            outcome.handle_table[0].as_deref(),
            Some(tags::STRING_CLASS_LABEL)
        );
    }

    #[test]
    fn out_of_range_reference_is_corrupted_stream() {
        let mut bytes = header();
        bytes.push(tags::TC_REFERENCE);
        bytes.extend_from_slice(&(tags::BASE_WIRE_HANDLE).to_be_bytes());
        let err = walk_bytes(&bytes).unwrap_err();
        assert!(matches!(err, ScanError::CorruptedStream(_)));
    }

    #[test]
    fn valid_back_reference_records_an_edge() {
        let mut bytes = header();
        bytes.push(tags::TC_STRING);
        bytes.extend_from_slice(&[0x00, 0x01, b'a']);
        bytes.push(tags::TC_BLOCKDATA);
        bytes.push(0x00); // zero-length, so nowObjectNumber (0) becomes parent
        bytes.push(tags::TC_REFERENCE);
        bytes.extend_from_slice(&(tags::BASE_WIRE_HANDLE).to_be_bytes());
        bytes.push(tags::TC_ENDBLOCKDATA);
        let (outcome, _) = walk_bytes(&bytes).unwrap();
        assert_eq!(outcome.edges.get(&0).map(|s| s.len()), Some(1));
    }

    #[test]
    fn oversized_array_length_fails_fast() {
        let mut bytes = header();
        bytes.push(tags::TC_ARRAY);
        bytes.push(tags::TC_CLASSDESC);
        bytes.extend_from_slice(&[0x00, 0x02]);
        bytes.extend_from_slice(b"[I");
        bytes.extend_from_slice(&0i64.to_be_bytes()); // serialVersionUID
        bytes.push(0x00); // flags
        bytes.extend_from_slice(&0i16.to_be_bytes()); // numFields
        bytes.push(tags::TC_NULL); // no superclass descriptor
        bytes.extend_from_slice(&70000i32.to_be_bytes());
        let err = walk_bytes(&bytes).unwrap_err();
        assert!(matches!(err, ScanError::ArrayTooLarge { .. }));
    }

    #[test]
    fn proxy_with_excessive_interfaces_fails_before_reading_names() {
        let mut bytes = header();
        bytes.push(tags::TC_PROXYCLASSDESC);
        bytes.extend_from_slice(&70000i32.to_be_bytes());
        // deliberately no interface name bytes follow; if the walker tried
        // to read them it would hit UnexpectedEof instead of ArrayTooLarge.
        let err = walk_bytes(&bytes).unwrap_err();
        assert!(matches!(err, ScanError::ArrayTooLarge { .. }));
    }

    #[test]
    fn mutually_exclusive_flags_are_rejected() {
        let mut bytes = header();
        bytes.push(tags::TC_CLASSDESC);
        bytes.extend_from_slice(&[0x00, 0x01]);
        bytes.extend_from_slice(b"X");
        bytes.extend_from_slice(&0i64.to_be_bytes());
        bytes.push(tags::SC_SERIALIZABLE | tags::SC_EXTERNALIZABLE);
        bytes.extend_from_slice(&0i16.to_be_bytes());
        let err = walk_bytes(&bytes).unwrap_err();
        assert!(matches!(err, ScanError::InvalidClassFlags(_)));
    }

    #[test]
    fn unrecognized_tag_is_skipped_and_walk_continues() {
        let mut bytes = header();
        bytes.push(0xFF); // not a valid TC_* tag
        bytes.push(tags::TC_NULL);
        let (outcome, _) = walk_bytes(&bytes).unwrap();
        assert!(outcome.handle_table.is_empty());
    }

    #[test]
    fn truncated_stream_ends_walk_without_error() {
        let mut bytes = header();
        bytes.push(tags::TC_STRING);
        bytes.extend_from_slice(&[0x00, 0x05]); // declares 5 bytes, supplies none
        let (outcome, sink) = walk_bytes(&bytes).unwrap();
        // the string's handle was assigned before the truncated body read failed
        assert_eq!(outcome.handle_table.len(), 1);
        assert!(sink
            .events
            .iter()
            .any(|e| matches!(e, crate::event::Event::Warn { .. })));
    }
}
