//! Newline-delimited JSON framing shared by every byte-stream channel.

use crate::mcp::error::TransportError;
use crate::mcp::protocol::JsonRpcMessage;

/// Longest line accepted before the decoder gives up on it.
pub const MAX_LINE_BYTES: usize = 32 * 1024 * 1024;

/// One complete line, or the report of a line too long to keep.
pub type Line = Result<String, TransportError>;

/// Reassembles complete lines from arbitrarily split byte chunks.
///
/// Bytes already searched for a newline are not searched again, and a line
/// growing past the limit is reported once as [`TransportError::Parse`] and
/// then skipped up to its newline.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    scanned: usize,
    discarding: bool,
    limit: usize,
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineDecoder {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            discarding: false,
            limit,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Line> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    /// Flushes a trailing line that never saw its newline.
    pub fn finish(&mut self) -> Vec<Line> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<Line> {
        let mut lines = Vec::new();
        let mut start = 0;
        let mut search = self.scanned;

        while let Some(offset) = self.buffer[search..].iter().position(|b| *b == b'\n') {
            let newline = search + offset;
            if self.discarding {
                self.discarding = false;
            } else {
                push_trimmed(&mut lines, &self.buffer[start..newline]);
            }
            start = newline + 1;
            search = start;
        }

        if flush {
            if !self.discarding {
                push_trimmed(&mut lines, &self.buffer[start..]);
            }
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = false;
            return lines;
        }

        self.buffer.drain(..start);
        if self.discarding {
            self.buffer.clear();
        } else if self.buffer.len() > self.limit {
            lines.push(Err(TransportError::Parse(format!(
                "line exceeds {} bytes",
                self.limit
            ))));
            self.buffer.clear();
            self.discarding = true;
        }
        self.scanned = self.buffer.len();
        lines
    }
}

fn push_trimmed(lines: &mut Vec<Line>, bytes: &[u8]) {
    // Invalid UTF-8 still becomes a line so the parser reports it.
    let text = String::from_utf8_lossy(bytes);
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        lines.push(Ok(trimmed.to_string()));
    }
}

/// Serializes one message as UTF-8 JSON followed by `\n`.
pub fn encode_line(message: &JsonRpcMessage) -> Result<Vec<u8>, TransportError> {
    let mut bytes =
        serde_json::to_vec(message).map_err(|err| TransportError::Parse(err.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decodes every complete line into a message, keeping parse failures in
/// place so callers can report them without dropping the rest.
pub fn decode_lines(lines: Vec<Line>) -> Vec<Result<JsonRpcMessage, TransportError>> {
    lines
        .into_iter()
        .map(|line| line.and_then(|line| JsonRpcMessage::parse(&line)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::protocol::RequestId;

    fn complete(lines: Vec<Line>) -> Vec<String> {
        lines.into_iter().map(|line| line.expect("complete line")).collect()
    }

    #[test]
    fn line_decoder_handles_chunk_boundaries() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push(b"{\"a\":").is_empty());
        assert_eq!(complete(decoder.push(b"1}\r\n{\"b\"")), vec!["{\"a\":1}"]);
        assert_eq!(complete(decoder.push(b":2}\n\n")), vec!["{\"b\":2}"]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn byte_at_a_time_input_yields_the_same_lines() {
        let input = b"{\"first\":1}\n{\"second\":2}\n";
        let mut decoder = LineDecoder::default();
        let mut lines = Vec::new();
        for byte in input {
            lines.extend(complete(decoder.push(std::slice::from_ref(byte))));
        }
        assert_eq!(lines, vec!["{\"first\":1}", "{\"second\":2}"]);
    }

    #[test]
    fn finish_flushes_unterminated_tail() {
        let mut decoder = LineDecoder::default();
        assert!(decoder.push(b"  tail  ").is_empty());
        assert_eq!(complete(decoder.finish()), vec!["tail"]);
        assert!(decoder.finish().is_empty());
    }

    #[test]
    fn oversized_line_is_reported_once_and_skipped() {
        let mut decoder = LineDecoder::with_limit(8);
        assert!(decoder.push(b"0123").is_empty());
        let overflow = decoder.push(b"456789");
        assert!(matches!(overflow.as_slice(), [Err(TransportError::Parse(_))]));
        assert!(decoder.push(b"more of the same line").is_empty());
        assert_eq!(complete(decoder.push(b"tail\nok\n")), vec!["ok"]);
        assert_eq!(complete(decoder.push(b"short\n")), vec!["short"]);
    }

    #[test]
    fn encoded_line_decodes_back() {
        let message = JsonRpcMessage::request(
            RequestId::Number(7),
            "tools/call",
            Some(serde_json::json!({"name": "Read", "arguments": {"path": "a\nb"}})),
        );
        let bytes = encode_line(&message).expect("encode");
        assert_eq!(bytes.last(), Some(&b'\n'));
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);

        let mut decoder = LineDecoder::default();
        let decoded = decode_lines(decoder.push(&bytes));
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().expect("message"), &message);
    }

    #[test]
    fn malformed_line_does_not_hide_the_next_one() {
        let mut decoder = LineDecoder::default();
        let decoded = decode_lines(
            decoder.push(b"not json\n{\"jsonrpc\":\"2.0\",\"method\":\"ping\",\"id\":1}\n"),
        );
        assert_eq!(decoded.len(), 2);
        assert!(decoded[0].is_err());
        assert!(decoded[1].is_ok());
    }
}
