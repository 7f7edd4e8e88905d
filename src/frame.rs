use tracing::warn;

use crate::{config::FrameFormat, events::Frame};

/// Splits a byte stream into frames regardless of how the transport chunks it.
///
/// Only complete lines are ever interpreted; the trailing partial line stays in
/// the buffer until the next `feed` (or `finish`). Working on bytes rather than
/// `str` keeps a multi-byte character split across two chunks intact.
#[derive(Debug)]
pub struct FrameParser {
    format: FrameFormat,
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
    record: Vec<String>,
    discarded: u64,
}

impl FrameParser {
    pub fn new(format: FrameFormat) -> Self {
        Self { format, buf: Vec::new(), scanned: 0, record: Vec::new(), discarded: 0 }
    }

    /// Frames dropped because they were not valid `{type, data}` JSON.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        let Some(pos) = self.buf[self.scanned..].iter().rposition(|b| *b == b'\n') else {
            self.scanned = self.buf.len();
            return out;
        };
        let complete: Vec<u8> = self.buf.drain(..=self.scanned + pos).collect();
        self.scanned = self.buf.len();
        // drained block ends with '\n', so the final split segment is always empty
        let mut lines: Vec<&[u8]> = complete.split(|b| *b == b'\n').collect();
        lines.pop();
        for line in lines {
            self.on_line(line, &mut out);
        }
        out
    }

    /// Flushes whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Vec<Frame> {
        let mut out = Vec::new();
        let rest = std::mem::take(&mut self.buf);
        self.scanned = 0;
        if !rest.is_empty() {
            self.on_line(&rest, &mut out);
        }
        if matches!(self.format, FrameFormat::Prefixed { .. }) {
            flush_record(&mut self.record, &mut out, &mut self.discarded);
        }
        out
    }

    fn on_line(&mut self, raw: &[u8], out: &mut Vec<Frame>) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = match std::str::from_utf8(raw) {
            Ok(s) => s,
            Err(e) => {
                self.discarded += 1;
                warn!(error = %e, "discarding frame line with invalid utf-8");
                return;
            }
        };
        match &self.format {
            FrameFormat::JsonLines => {
                if !line.trim().is_empty() {
                    emit(line, out, &mut self.discarded);
                }
            }
            FrameFormat::Prefixed { prefix } => {
                if line.is_empty() {
                    flush_record(&mut self.record, out, &mut self.discarded);
                } else if let Some(payload) = line.strip_prefix(prefix.as_str()) {
                    self.record.push(payload.trim_start().to_string());
                }
                // other fields (event:, id:, ":" comments) carry nothing we use
            }
        }
    }
}

fn flush_record(record: &mut Vec<String>, out: &mut Vec<Frame>, discarded: &mut u64) {
    if record.is_empty() {
        return;
    }
    let candidate = record.join("\n");
    record.clear();
    emit(&candidate, out, discarded);
}

fn emit(candidate: &str, out: &mut Vec<Frame>, discarded: &mut u64) {
    match serde_json::from_str::<Frame>(candidate) {
        Ok(frame) => out.push(frame),
        Err(e) => {
            *discarded += 1;
            warn!(error = %e, len = candidate.len(), "discarding malformed frame");
        }
    }
}
