//! Minimal server-sent-events wire parsing for the SSE return channel.

/// One parsed SSE event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field; the hub uses it for the envelope kind.
    pub event: String,
    /// The `data:` field(s), joined with newlines.
    pub data: String,
}

/// Incremental parser over the SSE byte stream.
///
/// Events are separated by blank lines; `event:` and `data:` fields are
/// collected, `id:` and comment lines are ignored. Bytes may arrive in
/// arbitrary chunks, so the parser buffers a partial trailing line.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
    event: String,
    data: Vec<String>,
}

impl SseParser {
    /// Create an empty parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return the events completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                if !self.event.is_empty() || !self.data.is_empty() {
                    events.push(SseEvent {
                        event: std::mem::take(&mut self.event),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
                continue;
            }
            if let Some(value) = field_value(line, "event") {
                self.event = value.to_string();
            } else if let Some(value) = field_value(line, "data") {
                self.data.push(value.to_string());
            }
            // id: and comment lines are ignored
        }
        events
    }
}

fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?;
    let rest = rest.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_events() {
        let mut p = SseParser::new();
        let events = p.feed(b"event: ping\ndata: \n\nevent: response\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "ping");
        assert_eq!(events[1].event, "response");
        assert_eq!(events[1].data, "{\"a\":1}");
    }

    #[test]
    fn handles_split_chunks() {
        let mut p = SseParser::new();
        assert!(p.feed(b"event: notif").is_empty());
        assert!(p.feed(b"ication\ndata: {}").is_empty());
        let events = p.feed(b"\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "notification");
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn joins_multi_line_data() {
        let mut p = SseParser::new();
        let events = p.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    #[test]
    fn ignores_comments_and_ids() {
        let mut p = SseParser::new();
        let events = p.feed(b": keep-alive\nid: 7\nevent: ping\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "ping");
    }
}
