use bytes::Bytes;

/// One decoded Server-Sent Event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    /// The openai stream terminator (`data: [DONE]`).
    pub fn is_done_marker(&self) -> bool {
        self.event.is_none() && self.data.trim() == "[DONE]"
    }

    /// Wire encoding, including the trailing blank line.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = String::with_capacity(self.data.len() + 32);
        if let Some(event) = &self.event {
            out.push_str("event: ");
            out.push_str(event);
            out.push('\n');
        }
        for line in self.data.split('\n') {
            out.push_str("data: ");
            out.push_str(line);
            out.push('\n');
        }
        out.push('\n');
        Bytes::from(out)
    }
}

/// Incremental SSE decoder fed arbitrary byte chunks.
///
/// Carries partial lines across chunk boundaries; comment lines and unknown
/// fields are dropped per the SSE spec.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    pending_event: Option<String>,
    pending_data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let Ok(text) = std::str::from_utf8(chunk) else {
            return Vec::new();
        };
        self.feed_str(text)
    }

    pub fn feed_str(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            self.accept_line(&line, &mut frames);
        }

        frames
    }

    /// Flush any trailing partial frame at end of stream.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            self.accept_line(&line, &mut frames);
        }
        self.flush_frame(&mut frames);
        frames
    }

    fn accept_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.flush_frame(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.pending_event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.pending_data.push(value.to_string()),
            _ => {}
        }
    }

    fn flush_frame(&mut self, frames: &mut Vec<SseFrame>) {
        if self.pending_event.is_none() && self.pending_data.is_empty() {
            return;
        }
        frames.push(SseFrame {
            event: self.pending_event.take(),
            data: std::mem::take(&mut self.pending_data).join("\n"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed(b"data: {\"a\":").is_empty());
        let frames = decoder.feed(b"1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":1}");
    }

    #[test]
    fn named_events_and_multiline_data() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed_str("event: message_start\ndata: one\ndata: two\n\n");
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn comments_are_skipped() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed_str(": keepalive\n\ndata: x\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn done_marker_round_trips() {
        let frame = SseFrame::data("[DONE]");
        assert!(frame.is_done_marker());
        let mut decoder = SseDecoder::new();
        let frames = decoder.feed(&frame.to_bytes());
        assert!(frames[0].is_done_marker());
    }

    #[test]
    fn finish_flushes_trailing_frame() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.feed_str("data: tail").is_empty());
        let frames = decoder.finish();
        assert_eq!(frames[0].data, "tail");
    }
}
