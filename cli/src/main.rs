// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

use std::io::{BufReader, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serial_guard_core::event::Event;
use serial_guard_core::{EventSink, UnsafeReason, Verdict};

/// Scans a Java-style object serialization stream for shapes that would
/// make deserializing it expensive or unbounded, without ever
/// deserializing it.
#[derive(Parser)]
#[command(author, version, about)]
struct Opts {
    /// Path to the serialized stream to scan.
    path: PathBuf,

    /// Emit each diagnostic as a line of JSON instead of formatted text.
    #[arg(long)]
    json: bool,

    /// Increase log verbosity; repeat for more (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress informational diagnostics; only the final verdict is printed.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let level = if opts.quiet {
        tracing::Level::ERROR
    } else {
        match opts.verbose {
            0 => tracing::Level::INFO,
            1 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let file = std::fs::File::open(&opts.path)
        .with_context(|| format!("opening {}", opts.path.display()))?;
    let reader = BufReader::new(file);

    let result = if opts.json {
        let mut sink = JsonSink::new(std::io::stdout());
        serial_guard_core::scan(reader, &mut sink)
    } else {
        let mut sink = TerminalSink::new(opts.quiet);
        serial_guard_core::scan(reader, &mut sink)
    };

    match result.context("scanning the object stream")? {
        Verdict::Safe => Ok(()),
        Verdict::Unsafe { .. } => std::process::exit(1),
    }
}

/// Human-readable sink: one line per event, routed to stdout (info,
/// descriptor, graph, verdict) or stderr (warnings). `quiet` keeps
/// everything but the verdict off stdout.
struct TerminalSink {
    quiet: bool,
}

impl TerminalSink {
    fn new(quiet: bool) -> Self {
        Self { quiet }
    }
}

impl EventSink for TerminalSink {
    fn record(&mut self, event: Event) {
        match event {
            Event::Info { message } => {
                if !self.quiet {
                    println!("info: {message}");
                }
            }
            Event::Warn { message } => {
                eprintln!("warn: {message}");
            }
            Event::Descriptor {
                name,
                serial_version_uid,
                num_fields,
            } => {
                if !self.quiet {
                    println!(
                        "class descriptor: {name} (serialVersionUID={serial_version_uid:#x}, fields={num_fields})"
                    );
                }
            }
            Event::Graph { handle, count } => {
                if !self.quiet {
                    println!("reference graph from handle {handle}: {count} reference(s)");
                }
            }
            Event::Verdict { verdict } => match verdict {
                Verdict::Safe => println!("verdict: safe"),
                Verdict::Unsafe { reason } => {
                    println!("verdict: unsafe ({})", describe_reason(reason))
                }
            },
        }
    }
}

/// JSON-lines sink: every event, serialized as-is, one per line.
struct JsonSink<W> {
    out: W,
}

impl<W: Write> JsonSink<W> {
    fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> EventSink for JsonSink<W> {
    fn record(&mut self, event: Event) {
        if let Ok(line) = serde_json::to_string(&event) {
            let _ = writeln!(self.out, "{line}");
        }
    }
}

fn describe_reason(reason: UnsafeReason) -> &'static str {
    match reason {
        UnsafeReason::ArrayTooLarge => "cumulative array size exceeds the limit",
        UnsafeReason::ReferenceTooComplex => "reference graph traversal exceeded the limit",
    }
}
