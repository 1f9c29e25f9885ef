//! Minimal terminal answering for pty output.
//!
//! Some CLIs ask the terminal for the cursor position (`ESC[6n` or
//! `ESC[?6n`) and stall until they get an answer. [`CursorQueryFilter`]
//! strips those queries from the output stream and counts them; the reader
//! then writes one [`CURSOR_REPLY`] per query to the child's input. No other
//! terminal behaviour is emulated.
//!
//! Reads can split a query (or a multi-byte UTF-8 character) across two
//! chunks, so the filter holds back such trailing fragments until the next
//! chunk arrives or the stream ends.

/// Cursor position queries, with and without the DEC private marker.
pub const CURSOR_QUERIES: [&[u8]; 2] = [b"\x1b[6n", b"\x1b[?6n"];

/// Reply reporting the cursor at row 1, column 1.
pub const CURSOR_REPLY: &[u8] = b"\x1b[1;1R";

/// Output of one filtering step.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Filtered {
    /// Text to forward (queries removed).
    pub text: String,
    /// Number of queries removed; each needs one reply.
    pub queries: usize,
}

/// Streaming cursor-query stripper.
#[derive(Debug, Default)]
pub struct CursorQueryFilter {
    pending: Vec<u8>,
}

impl CursorQueryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter one chunk of raw output.
    pub fn feed(&mut self, chunk: &[u8]) -> Filtered {
        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(chunk);

        let mut out = Vec::with_capacity(data.len());
        let mut queries = 0;
        let mut held: &[u8] = &[];
        let mut i = 0;

        'scan: while i < data.len() {
            if data[i] == 0x1b {
                let rest = &data[i..];
                for query in CURSOR_QUERIES {
                    if rest.starts_with(query) {
                        queries += 1;
                        i += query.len();
                        continue 'scan;
                    }
                }
                if is_partial_query(rest) {
                    held = rest;
                    break;
                }
            }
            out.push(data[i]);
            i += 1;
        }

        let tail = incomplete_utf8_tail(&out);
        let complete = out.len() - tail;
        let mut pending = out[complete..].to_vec();
        pending.extend_from_slice(held);
        self.pending = pending;

        Filtered {
            text: String::from_utf8_lossy(&out[..complete]).into_owned(),
            queries,
        }
    }

    /// Flush held-back bytes at end of stream.
    pub fn finish(&mut self) -> Filtered {
        let pending = std::mem::take(&mut self.pending);
        Filtered {
            text: String::from_utf8_lossy(&pending).into_owned(),
            queries: 0,
        }
    }
}

/// Whether `rest` is a proper prefix of some cursor query.
fn is_partial_query(rest: &[u8]) -> bool {
    CURSOR_QUERIES
        .iter()
        .any(|query| rest.len() < query.len() && query.starts_with(rest))
}

/// Length of a trailing, not-yet-complete UTF-8 sequence.
fn incomplete_utf8_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = if byte & 0xE0 == 0xC0 {
            2
        } else if byte & 0xF0 == 0xE0 {
            3
        } else if byte & 0xF8 == 0xF0 {
            4
        } else {
            1
        };
        return if needed > back { back } else { 0 };
    }
    0
}
