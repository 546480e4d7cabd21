//! Log capture for TUI mode
//!
//! `LogBuffer` implements `MakeWriter`, so the fmt layer writes here instead
//! of stderr while the alternate screen is up. The log pane drains it once per
//! frame.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

/// Lines held between two drains.
const DEFAULT_CAPACITY: usize = 500;

/// Level parsed back out of a formatted log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warn,
    Info,
    Debug,
}

impl Severity {
    /// The fmt layer puts the level as the first word after the timestamp.
    pub fn of(line: &str) -> Self {
        for word in line.split_whitespace().take(3) {
            match word {
                "ERROR" => return Severity::Error,
                "WARN" => return Severity::Warn,
                "INFO" => return Severity::Info,
                "DEBUG" | "TRACE" => return Severity::Debug,
                _ => {}
            }
        }
        Severity::Info
    }
}

struct Ring {
    lines: VecDeque<String>,
    capacity: usize,
    dropped: usize,
}

/// Shared, bounded buffer of log lines.
#[derive(Clone)]
pub struct LogBuffer {
    ring: Arc<Mutex<Ring>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: Arc::new(Mutex::new(Ring {
                lines: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                dropped: 0,
            })),
        }
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: String) {
        // A poisoned lock must not take logging down with it.
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.lines.len() >= ring.capacity {
            ring.lines.pop_front();
            ring.dropped += 1;
        }
        ring.lines.push_back(line);
    }

    /// Take every buffered line, oldest first, plus how many were evicted
    /// since the last drain.
    pub fn drain(&self) -> (Vec<String>, usize) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        let dropped = std::mem::take(&mut ring.dropped);
        (ring.lines.drain(..).collect(), dropped)
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits written bytes into lines and pushes complete ones.
pub struct LineWriter {
    buffer: LogBuffer,
    pending: Vec<u8>,
}

impl LineWriter {
    fn emit_complete_lines(&mut self) {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            self.buffer.push(text.trim_end_matches('\r').to_string());
        }
    }
}

impl Write for LineWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.emit_complete_lines();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.pending.is_empty() {
            let text = String::from_utf8_lossy(&self.pending).into_owned();
            self.buffer.push(text);
            self.pending.clear();
        }
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        let _ = Write::flush(self);
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LineWriter {
            buffer: self.clone(),
            pending: Vec::new(),
        }
    }
}
