// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! DoS analyzer (component D).
//!
//! Two independent bookkeeping checks, both fed by the grammar walker: a
//! running sum of declared array/interface lengths, and a bounded
//! traversal of the reference graph built while walking.

use std::collections::{HashMap, HashSet};

use crate::error::{ScanError, ScanResult};
use crate::event::EventSink;
use crate::tags;

#[derive(Debug, Default)]
pub struct DosAnalyzer {
    total_array_size: i64,
}

impl DosAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_array_size(&self) -> i64 {
        self.total_array_size
    }

    /// Adds one declared array length or proxy interface count to the
    /// running total. The length is sign-extended into 64 bits before
    /// summation so a single negative length can't wrap the accumulator;
    /// negative lengths contribute zero but are not themselves rejected,
    /// since the grammar walker never multiplies by them.
    pub fn record_array_length(
        &mut self,
        declared_length: i32,
        sink: &mut impl EventSink,
    ) -> ScanResult<()> {
        let contribution = i64::from(declared_length).max(0);
        self.total_array_size += contribution;
        sink.info(format!(
            "array/interface length {declared_length} recorded, running total {}",
            self.total_array_size
        ));
        if self.total_array_size > tags::ARRAY_SIZE_MAX {
            return Err(ScanError::ArrayTooLarge {
                total: self.total_array_size,
                max: tags::ARRAY_SIZE_MAX,
            });
        }
        Ok(())
    }

    /// For every handle `t` with at least one referrer, walks the inverse
    /// reference edges outward from `t` with a work stack, not the call
    /// stack (a cyclic or diamond-shaped graph must not be able to blow
    /// out this scanner's own stack). No visited set is kept: a diamond
    /// graph counts the shared descendant once per path that reaches it.
    /// This is deliberate. The counter cap is the sole termination guard
    /// and is what lets a handful of shared objects detect an
    /// exponential-fanout "Billion Laughs" graph without enumerating it.
    pub fn check_reference_graph(
        &self,
        handle_count: usize,
        edges: &HashMap<i32, HashSet<i32>>,
        sink: &mut impl EventSink,
    ) -> ScanResult<()> {
        for t in 0..i32::try_from(handle_count).unwrap_or(i32::MAX) {
            let Some(sources) = edges.get(&t) else {
                continue;
            };
            if sources.is_empty() {
                continue;
            }
            let mut ref_count: u64 = 0;
            let mut stack: Vec<i32> = sources.iter().copied().collect();
            while let Some(s) = stack.pop() {
                ref_count += 1;
                if ref_count > tags::REFERENCE_MAX {
                    sink.graph(t, ref_count);
                    return Err(ScanError::ReferenceTooComplex {
                        start: t,
                        max: tags::REFERENCE_MAX,
                    });
                }
                // Handle zero is a sentinel root and is never expanded
                // further, even if it has its own referrers.
                if s == 0 {
                    continue;
                }
                if let Some(next) = edges.get(&s) {
                    stack.extend(next.iter().copied());
                }
            }
            sink.graph(t, ref_count);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RecordingSink;
    use quickcheck_macros::quickcheck;

    fn total_for(lengths: &[i32]) -> i64 {
        let mut sink = RecordingSink::new();
        let mut analyzer = DosAnalyzer::new();
        for &len in lengths {
            // Once the cap trips further calls would stop, which would
            // itself make the order matter, so only sum the prefix that
            // stays under the cap, same as the walker would.
            if analyzer.record_array_length(len, &mut sink).is_err() {
                break;
            }
        }
        analyzer.total_array_size()
    }

    /// The running total is a sum over however the walker happens to
    /// chunk its calls. It must not depend on the order lengths arrive
    /// in, only on which prefix stays under the cap.
    #[quickcheck]
    fn array_length_sum_is_order_independent(mut lengths: Vec<i32>) -> bool {
        lengths.truncate(32);
        lengths.retain(|&len| i64::from(len) < tags::ARRAY_SIZE_MAX);
        let forward = total_for(&lengths);
        let mut reversed = lengths.clone();
        reversed.reverse();
        forward == total_for(&reversed)
    }

    #[test]
    fn array_size_accumulates_and_caps() {
        let mut sink = RecordingSink::new();
        let mut analyzer = DosAnalyzer::new();
        assert!(analyzer.record_array_length(65536, &mut sink).is_ok());
        assert_eq!(analyzer.total_array_size(), 65536);
    }

    #[test]
    fn array_size_over_limit_fails() {
        let mut sink = RecordingSink::new();
        let mut analyzer = DosAnalyzer::new();
        analyzer.record_array_length(65536, &mut sink).unwrap();
        let err = analyzer.record_array_length(1, &mut sink).unwrap_err();
        assert!(matches!(err, ScanError::ArrayTooLarge { total: 65537, .. }));
    }

    #[test]
    fn negative_length_contributes_zero() {
        let mut sink = RecordingSink::new();
        let mut analyzer = DosAnalyzer::new();
        analyzer.record_array_length(-50, &mut sink).unwrap();
        assert_eq!(analyzer.total_array_size(), 0);
    }

    #[test]
    fn reference_cycle_within_cap_is_ok() {
        let mut sink = RecordingSink::new();
        let mut edges: HashMap<i32, HashSet<i32>> = HashMap::new();
        edges.entry(1).or_default().insert(2);
        edges.entry(2).or_default().insert(1);
        let analyzer = DosAnalyzer::new();
        assert!(analyzer
            .check_reference_graph(3, &edges, &mut sink)
            .is_ok());
    }

    #[test]
    fn dense_fanout_exceeds_cap() {
        let mut sink = RecordingSink::new();
        let mut edges: HashMap<i32, HashSet<i32>> = HashMap::new();
        // handle 1 has REFERENCE_MAX + 1 direct referrers.
        let referrers: HashSet<i32> = (10..10 + tags::REFERENCE_MAX as i32 + 1).collect();
        edges.insert(1, referrers);
        let analyzer = DosAnalyzer::new();
        let err = analyzer
            .check_reference_graph(2, &edges, &mut sink)
            .unwrap_err();
        assert!(matches!(err, ScanError::ReferenceTooComplex { start: 1, .. }));
    }
}
