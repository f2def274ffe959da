//! Line-oriented report output.
//!
//! Reports are handed to a [`LineSink`] one line at a time, never with an
//! embedded newline. [`SinkWriter`] adapts a sink to `fmt::Write`: it splits on
//! `\n`, prefixes each line, and formats into a fixed buffer so writing a
//! report from a signal handler does not allocate.

use std::fmt;

const LINE_CAPACITY: usize = 1024;

pub trait LineSink: Send + Sync {
    fn line(&self, line: &str);
}

impl<F> LineSink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn line(&self, line: &str) {
        self(line)
    }
}

/// Forwards report lines to `tracing` at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LineSink for TracingSink {
    fn line(&self, line: &str) {
        tracing::error!(target: "faultline::report", "{line}");
    }
}

/// Writes report lines to standard error.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl LineSink for StderrSink {
    fn line(&self, line: &str) {
        eprintln!("{line}");
    }
}

struct LineBuf {
    bytes: [u8; LINE_CAPACITY],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        Self {
            bytes: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    fn push_str(&mut self, s: &str) {
        let room = LINE_CAPACITY - self.len;
        let take = if s.len() <= room {
            s.len()
        } else {
            // Truncate on a char boundary.
            (0..=room).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
        };
        self.bytes[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
    }

    fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes[..self.len]).unwrap_or("")
    }

    fn clear(&mut self) {
        self.len = 0;
    }
}

pub struct SinkWriter<'a> {
    sink: &'a dyn LineSink,
    prefix: &'a str,
    line: LineBuf,
    started: bool,
}

impl<'a> SinkWriter<'a> {
    pub fn new(sink: &'a dyn LineSink, prefix: &'a str) -> Self {
        Self {
            sink,
            prefix,
            line: LineBuf::new(),
            started: false,
        }
    }

    fn start_line(&mut self) {
        if !self.started {
            self.started = true;
            if !self.prefix.is_empty() {
                self.line.push_str(self.prefix);
                self.line.push_str(" ");
            }
        }
    }

    fn flush_line(&mut self) {
        self.start_line();
        self.sink.line(self.line.as_str());
        self.line.clear();
        self.started = false;
    }

    /// Emits a trailing partial line, if any.
    pub fn finish(mut self) {
        if self.started {
            self.flush_line();
        }
    }
}

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let mut rest = s;
        while let Some(newline) = rest.find('\n') {
            self.start_line();
            self.line.push_str(&rest[..newline]);
            self.flush_line();
            rest = &rest[newline + 1..];
        }
        if !rest.is_empty() {
            self.start_line();
            self.line.push_str(rest);
        }
        Ok(())
    }
}
