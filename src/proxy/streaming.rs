//! SSE framing for the upstream chat-completion stream.
//!
//! Chat completion streams are `data:`-only (no named events), terminated
//! by a `data: [DONE]` sentinel. Blocks are framed at the byte level so
//! partial chunks and CRLF line endings need no intermediate copies.

use std::borrow::Cow;

use bytes::BytesMut;

/// Byte offset and length of the first blank-line delimiter in the buffer:
/// a newline directly followed by another newline, with an optional `\r`
/// between them.
fn find_delimiter(buffer: &[u8]) -> Option<(usize, usize)> {
    for (at, byte) in buffer.iter().enumerate() {
        if *byte != b'\n' {
            continue;
        }
        match (buffer.get(at + 1), buffer.get(at + 2)) {
            (Some(b'\n'), _) => return Some((at, 2)),
            (Some(b'\r'), Some(b'\n')) => return Some((at, 3)),
            _ => {}
        }
    }
    None
}

/// Assembles incoming byte chunks into complete SSE blocks.
pub(crate) struct SseFramer {
    buffer: BytesMut,
}

impl SseFramer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// The next complete block, if one is buffered. Blocks without any
    /// visible content are dropped.
    pub fn next_block(&mut self) -> Option<String> {
        loop {
            let (at, delimiter_len) = find_delimiter(&self.buffer)?;
            let block = self.buffer.split_to(at + delimiter_len);
            let text = String::from_utf8_lossy(&block[..at]);
            if text.trim().is_empty() {
                continue;
            }
            return Some(text.into_owned());
        }
    }
}

/// Join the `data:` lines of one SSE block. Comment lines (leading `:`) and
/// non-data fields are ignored; returns `None` when the block carries no
/// data at all.
pub(crate) fn block_data(block: &str) -> Option<Cow<'_, str>> {
    let mut data_lines: Vec<&str> = Vec::new();

    for line in block.lines() {
        // The framer cuts before the delimiter, so the last line of a CRLF
        // block keeps a bare trailing \r.
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start());
        }
    }

    match data_lines.len() {
        0 => None,
        1 => Some(Cow::Borrowed(data_lines[0])),
        _ => Some(Cow::Owned(data_lines.join("\n"))),
    }
}
