/// One dispatched Server-Sent Events frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the `event:` field, empty when the frame had none.
    pub event: String,
    /// Concatenated `data:` lines, joined with `\n`.
    pub data: String,
}

/// Longest line kept while waiting for its terminating newline.
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

/// Incremental decoder for a `text/event-stream` body.
///
/// Bytes may arrive split at arbitrary points (including inside a UTF-8
/// sequence); only complete lines are interpreted. A blank line dispatches
/// the frame accumulated so far. A line longer than the cap is discarded
/// together with the frame it belongs to.
#[derive(Debug)]
pub struct SseDecoder {
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no newline.
    scanned: usize,
    max_line_len: usize,
    /// Skipping the tail of an oversized line.
    discarding_line: bool,
    /// The current frame lost a line and must not be dispatched.
    discarding_frame: bool,
    dropped_lines: u64,
    event: String,
    data: Vec<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line_len(DEFAULT_MAX_LINE_LEN)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_len(max_line_len: usize) -> Self {
        Self {
            pending: Vec::new(),
            scanned: 0,
            max_line_len: max_line_len.max(1),
            discarding_line: false,
            discarding_frame: false,
            dropped_lines: 0,
            event: String::new(),
            data: Vec::new(),
        }
    }

    /// Feed a chunk of the response body, returning every frame it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.pending.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut consumed = 0;
        let mut search_from = self.scanned;

        while let Some(offset) = self.pending[search_from..].iter().position(|b| *b == b'\n') {
            let end = search_from + offset;
            let mut line = &self.pending[consumed..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            let line = String::from_utf8_lossy(line).into_owned();
            consumed = end + 1;
            search_from = consumed;

            if std::mem::take(&mut self.discarding_line) {
                continue;
            }
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        self.pending.drain(..consumed);
        self.scanned = self.pending.len();

        if self.pending.len() > self.max_line_len {
            self.pending.clear();
            self.scanned = 0;
            if !self.discarding_line {
                self.discarding_line = true;
                self.discarding_frame = true;
                self.dropped_lines += 1;
            }
        }

        frames
    }

    /// Oversized lines dropped since the last call.
    pub fn take_dropped_lines(&mut self) -> u64 {
        std::mem::take(&mut self.dropped_lines)
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }

        // Comment / keep-alive.
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = value.to_string(),
            "data" => self.data.push(value.to_string()),
            // id / retry carry nothing we act on.
            _ => {}
        }

        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = std::mem::take(&mut self.event);
        if std::mem::take(&mut self.discarding_frame) {
            self.data.clear();
            return None;
        }
        if self.data.is_empty() {
            return None;
        }

        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}
