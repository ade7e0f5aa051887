// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Diagnostic event surface (component E).
//!
//! The walker and analyzer never write to a terminal directly; they push
//! events through an [`EventSink`]. The CLI supplies a terminal sink; tests
//! supply a [`RecordingSink`] and assert against the recorded sequence.

use crate::verdict::Verdict;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    Info { message: String },
    Warn { message: String },
    Descriptor {
        name: String,
        serial_version_uid: i64,
        num_fields: i16,
    },
    Graph { handle: i32, count: u64 },
    Verdict { verdict: Verdict },
}

/// Capability the walker (C) and analyzer (D) emit diagnostics through.
///
/// Implementations decide routing; the trait itself carries no I/O.
pub trait EventSink {
    fn info(&mut self, message: impl Into<String>) {
        self.record(Event::Info {
            message: message.into(),
        });
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.record(Event::Warn {
            message: message.into(),
        });
    }

    fn descriptor(&mut self, name: impl Into<String>, serial_version_uid: i64, num_fields: i16) {
        self.record(Event::Descriptor {
            name: name.into(),
            serial_version_uid,
            num_fields,
        });
    }

    fn graph(&mut self, handle: i32, count: u64) {
        self.record(Event::Graph { handle, count });
    }

    fn verdict(&mut self, verdict: Verdict) {
        self.record(Event::Verdict { verdict });
    }

    /// Every other method above funnels through here; implement this one.
    fn record(&mut self, event: Event);
}

/// In-memory sink used by tests (and available to any caller that wants
/// the raw event stream instead of formatted output).
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub events: Vec<Event>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventSink for RecordingSink {
    fn record(&mut self, event: Event) {
        self.events.push(event);
    }
}
