use serde_json::Value;
use tracing::warn;

/// Hard cap on buffered upstream bytes; overflow drops the buffer.
const MAX_BUFFER_BYTES: usize = 10 * 1024 * 1024;

/// JSON payload openers the upstream embeds between binary framing headers.
const KNOWN_PREFIXES: [&str; 6] = [
    "{\"content\":",
    "{\"name\":",
    "{\"input\":",
    "{\"stop\":",
    "{\"followupPrompt\":",
    "{\"contextUsagePercentage\":",
];

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum KiroEvent {
    Content(String),
    ToolUseStart {
        tool_use_id: String,
        name: String,
        input: Option<String>,
    },
    ToolUseInput(String),
    ToolUseStop,
    ContextUsage(f64),
}

/// Scans the raw byte stream for known JSON payloads.
///
/// The upstream interleaves framed JSON with binary headers; rather than
/// decode the framing, the parser hunts for known key prefixes and extracts
/// each object with a string-aware brace scanner. Unrecognised or malformed
/// segments are skipped; progress resumes after the last parsed closer.
#[derive(Debug, Default)]
pub(crate) struct KiroEventParser {
    buffer: Vec<u8>,
    last_content: Option<String>,
}

impl KiroEventParser {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<KiroEvent> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.len() > MAX_BUFFER_BYTES {
            warn!(
                buffered = self.buffer.len(),
                "kiro stream buffer overflow, dropping buffered data"
            );
            self.buffer.clear();
            return Vec::new();
        }

        let mut events = Vec::new();
        let mut scan_from = 0usize;
        loop {
            let Some(start) = find_next_prefix(&self.buffer, scan_from) else {
                break;
            };
            let Some(end) = find_json_end(&self.buffer, start) else {
                // Incomplete object: keep from its opening brace.
                scan_from = start;
                break;
            };
            match serde_json::from_slice::<Value>(&self.buffer[start..end]) {
                Ok(value) => {
                    if let Some(event) = self.classify(&value) {
                        events.push(event);
                    }
                }
                Err(_) => {
                    // Malformed segment; step past the opener and keep going.
                    scan_from = start + 1;
                    continue;
                }
            }
            scan_from = end;
        }
        self.buffer.drain(..scan_from);
        events
    }

    fn classify(&mut self, value: &Value) -> Option<KiroEvent> {
        if let Some(content) = value.get("content").and_then(|v| v.as_str()) {
            // The upstream occasionally repeats a frame; drop exact dups.
            if self.last_content.as_deref() == Some(content) {
                return None;
            }
            self.last_content = Some(content.to_string());
            return Some(KiroEvent::Content(content.to_string()));
        }
        if let Some(name) = value.get("name").and_then(|v| v.as_str()) {
            let tool_use_id = value
                .get("toolUseId")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let input = value
                .get("input")
                .and_then(|v| v.as_str())
                .map(|v| v.to_string());
            return Some(KiroEvent::ToolUseStart {
                tool_use_id,
                name: name.to_string(),
                input,
            });
        }
        if let Some(input) = value.get("input").and_then(|v| v.as_str()) {
            return Some(KiroEvent::ToolUseInput(input.to_string()));
        }
        if value.get("stop").is_some() {
            return Some(KiroEvent::ToolUseStop);
        }
        if let Some(percentage) = value.get("contextUsagePercentage").and_then(|v| v.as_f64()) {
            return Some(KiroEvent::ContextUsage(percentage));
        }
        // followupPrompt frames are recognised but carry nothing we forward.
        None
    }
}

fn find_next_prefix(buffer: &[u8], from: usize) -> Option<usize> {
    let mut best: Option<usize> = None;
    for prefix in KNOWN_PREFIXES {
        if let Some(at) = find_subslice(buffer, prefix.as_bytes(), from) {
            best = Some(match best {
                Some(current) => current.min(at),
                None => at,
            });
        }
    }
    best
}

fn find_subslice(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|at| at + from)
}

/// Index one past the brace that closes the object opening at `start`.
/// Respects string literals and escape sequences.
fn find_json_end(buffer: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in buffer[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset + 1);
                }
            }
            _ => {}
        }
    }
    None
}
