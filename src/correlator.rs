//! Output correlation for the worker's line protocol.
//!
//! The worker has no framing beyond newlines and no request identifiers. A
//! finished recognition is announced by a line containing `Result: <text>`
//! somewhere in its stdout. The correlator accumulates everything the worker
//! printed since the current request was admitted and scans complete lines
//! of that buffer for the marker, so a marker split across chunks is still
//! found.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Returned in place of the recognition when the marker is present but its
/// payload cannot be parsed.
pub const MALFORMED_PLACEHOLDER: &str = "Could not parse result.";

const MARKER: &str = "Result:";

static RESULT_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Result: (.*)").expect("Valid regex pattern"));

/// Outcome of a successful scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extraction {
    /// Marker line parsed; payload trimmed of surrounding whitespace
    Recognized(String),
    /// Marker seen without a parsable payload
    Malformed,
}

impl Extraction {
    pub fn into_text(self) -> String {
        match self {
            Extraction::Recognized(text) => text,
            Extraction::Malformed => MALFORMED_PLACEHOLDER.to_string(),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Extraction::Malformed)
    }
}

/// A finished recognition: the requested file path and the extracted text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recognition {
    #[serde(rename = "filePath")]
    pub file_path: String,
    pub recognition: String,
}

impl Recognition {
    pub fn new(file_path: impl Into<String>, extraction: Extraction) -> Self {
        Self {
            file_path: file_path.into(),
            recognition: extraction.into_text(),
        }
    }
}

#[derive(Debug, Default)]
pub struct OutputCorrelator {
    buffer: Vec<u8>,
    /// Offset of the first byte of the first line not yet scanned
    scanned: usize,
    /// Everything before this offset is known to hold no unscanned newline
    searched: usize,
    complete: bool,
}

impl OutputCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget all output seen so far. Called once per admitted request,
    /// before its payload reaches the worker.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.searched = 0;
        self.complete = false;
    }

    /// Append a stdout chunk and try to extract the result.
    ///
    /// Returns `Some` exactly once per reset: on the first complete line
    /// carrying the marker. Later chunks are still accumulated but never
    /// produce a second extraction.
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Extraction> {
        self.buffer.extend_from_slice(chunk);
        if self.complete {
            return None;
        }

        let extraction = self.scan();
        self.complete = extraction.is_some();
        extraction
    }

    /// Treat the unterminated tail as a final line. Called once the worker's
    /// stdout reached EOF; a line cut off by EOF is still complete.
    pub fn finish(&mut self) -> Option<Extraction> {
        if self.complete || self.scanned == self.buffer.len() {
            return None;
        }

        let extraction = extract_marker(&String::from_utf8_lossy(&self.buffer[self.scanned..]));
        self.scanned = self.buffer.len();
        self.searched = self.scanned;
        self.complete = extraction.is_some();
        extraction
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Everything accumulated since the last reset
    pub fn accumulated(&self) -> &[u8] {
        &self.buffer
    }

    fn scan(&mut self) -> Option<Extraction> {
        while let Some(offset) = self.buffer[self.searched..].iter().position(|&b| b == b'\n') {
            let end = self.searched + offset;
            let line = String::from_utf8_lossy(&self.buffer[self.scanned..end]);
            self.scanned = end + 1;
            self.searched = self.scanned;

            if let Some(extraction) = extract_marker(&line) {
                return Some(extraction);
            }
        }
        self.searched = self.buffer.len();
        None
    }
}

/// Parse a single complete line
pub fn extract_marker(line: &str) -> Option<Extraction> {
    if !line.contains(MARKER) {
        return None;
    }

    Some(
        match RESULT_LINE.captures(line).and_then(|caps| caps.get(1)) {
            Some(payload) => Extraction::Recognized(payload.as_str().trim().to_string()),
            None => Extraction::Malformed,
        },
    )
}
