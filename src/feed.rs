use serde_json::Value;

/// One decoded line of a monitoring feed. Accepts newline-delimited JSON
/// and server-sent-event `data:` lines.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedFrame {
    Payload(Value),
    /// Blank lines, SSE comments and non-data SSE fields.
    KeepAlive,
    Malformed(String),
}

impl FeedFrame {
    pub fn parse_line(line: &str) -> Self {
        let text = line.trim();
        if text.is_empty() || text.starts_with(':') {
            return FeedFrame::KeepAlive;
        }
        let text = match text.strip_prefix("data:") {
            Some(data) => data.trim_start(),
            None if is_sse_field(text) => return FeedFrame::KeepAlive,
            None => text,
        };
        match serde_json::from_str::<Value>(text) {
            Ok(value) => FeedFrame::Payload(unwrap_notification(value)),
            Err(_) => FeedFrame::Malformed(text.chars().take(200).collect()),
        }
    }
}

fn is_sse_field(text: &str) -> bool {
    ["event:", "id:", "retry:"]
        .iter()
        .any(|field| text.starts_with(field))
}

/// Notifications of the form `{"method": m, "params": p}` without an `id`
/// are flattened to `p` with `method` folded in as `event`.
fn unwrap_notification(value: Value) -> Value {
    let is_notification = value.get("id").is_none()
        && value.get("method").and_then(Value::as_str).is_some()
        && value.get("params").is_some_and(Value::is_object);
    if !is_notification {
        return value;
    }
    match value {
        Value::Object(mut envelope) => {
            let method = envelope.remove("method").unwrap_or(Value::Null);
            match envelope.remove("params") {
                Some(Value::Object(mut params)) => {
                    params.entry("event").or_insert(method);
                    Value::Object(params)
                }
                Some(other) => other,
                None => Value::Null,
            }
        }
        other => other,
    }
}

/// Longest line kept by [`LineBuffer`] by default (1 MiB).
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Reassembles lines from arbitrarily split byte chunks. Lines longer than
/// the limit are discarded and counted instead of buffered.
#[derive(Debug)]
pub struct LineBuffer {
    partial: Vec<u8>,
    limit: usize,
    overflowed: bool,
    oversized: u64,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            partial: Vec::new(),
            limit: limit.max(1),
            overflowed: false,
            oversized: 0,
        }
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if self.overflowed {
                    self.overflowed = false;
                    self.oversized += 1;
                } else {
                    let raw = std::mem::take(&mut self.partial);
                    lines.push(decode(&raw));
                }
            } else if self.overflowed {
                // Rest of an oversized line.
            } else if self.partial.len() >= self.limit {
                self.overflowed = true;
                self.partial = Vec::new();
            } else {
                self.partial.push(byte);
            }
        }
        lines
    }

    /// Whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.overflowed {
            self.overflowed = false;
            self.oversized += 1;
            return None;
        }
        if self.partial.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.partial);
        Some(decode(&raw))
    }

    /// Bytes held for the line in progress.
    pub fn buffered(&self) -> usize {
        self.partial.len()
    }

    /// Lines dropped for exceeding the limit.
    pub fn oversized(&self) -> u64 {
        self.oversized
    }
}

fn decode(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_ndjson_line() {
        let frame = FeedFrame::parse_line(r#"{"service":"api","status":"down"}"#);
        assert_eq!(
            frame,
            FeedFrame::Payload(json!({"service": "api", "status": "down"}))
        );
    }

    #[test]
    fn parses_sse_data_line() {
        let frame = FeedFrame::parse_line(r#"data: {"cpu": 93.5}"#);
        assert_eq!(frame, FeedFrame::Payload(json!({"cpu": 93.5})));
    }

    #[test]
    fn keepalives_and_sse_fields_are_ignored() {
        for line in ["", "   ", ": ping", "event: update", "id: 7", "retry: 3000"] {
            assert_eq!(FeedFrame::parse_line(line), FeedFrame::KeepAlive, "{:?}", line);
        }
    }

    #[test]
    fn malformed_lines_are_flagged() {
        assert!(matches!(
            FeedFrame::parse_line("{not json"),
            FeedFrame::Malformed(_)
        ));
        assert!(matches!(
            FeedFrame::parse_line("data: <html>"),
            FeedFrame::Malformed(_)
        ));
    }

    #[test]
    fn notification_envelope_is_flattened() {
        let frame = FeedFrame::parse_line(
            r#"{"jsonrpc":"2.0","method":"health:update","params":{"service":"db","status":"timeout"}}"#,
        );
        assert_eq!(
            frame,
            FeedFrame::Payload(json!({"service": "db", "status": "timeout", "event": "health:update"}))
        );
    }

    #[test]
    fn responses_with_id_are_left_alone() {
        let raw = json!({"jsonrpc": "2.0", "id": 1, "method": "x", "params": {"a": 1}});
        let frame = FeedFrame::parse_line(&raw.to_string());
        assert_eq!(frame, FeedFrame::Payload(raw));
    }

    #[test]
    fn line_buffer_joins_split_chunks() {
        let mut buf = LineBuffer::new();
        assert!(buf.push(b"{\"a\":").is_empty());
        assert_eq!(buf.push(b"1}\r\n{\"b\""), vec!["{\"a\":1}"]);
        assert_eq!(buf.push(b":2}\n\n"), vec!["{\"b\":2}", ""]);
        assert_eq!(buf.finish(), None);
        buf.push(b"tail");
        assert_eq!(buf.finish().as_deref(), Some("tail"));
    }

    #[test]
    fn overlong_lines_are_dropped_without_buffering() {
        let mut buf = LineBuffer::with_limit(8);
        assert!(buf.push(b"0123456789").is_empty());
        assert!(buf.push(&[b'x'; 4096]).is_empty());
        assert_eq!(buf.buffered(), 0);

        assert_eq!(buf.push(b"\n{\"a\":1}\n"), vec!["{\"a\":1}"]);
        assert_eq!(buf.oversized(), 1);

        // Exactly at the limit is still a line.
        assert_eq!(buf.push(b"12345678\n"), vec!["12345678"]);

        buf.push(b"still too long");
        assert_eq!(buf.finish(), None);
        assert_eq!(buf.oversized(), 2);
    }
}
