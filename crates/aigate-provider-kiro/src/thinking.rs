const OPEN_TAG: &str = "<thinking>";
const CLOSE_TAG: &str = "</thinking>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TextSegment {
    Thinking(String),
    Text(String),
}

enum Found {
    At(usize),
    /// A candidate starts here but is cut off by the chunk boundary.
    Partial(usize),
    None,
}

/// Splits a streamed answer into thinking and plain text segments.
///
/// Every flush withholds a tag-length suffix so a tag split across two chunks
/// is still detected. A match whose neighbouring character is a quote is a
/// literal inside tool arguments, not a tag.
#[derive(Debug, Default)]
pub(crate) struct ThinkingTagSplitter {
    pending: String,
    in_thinking: bool,
}

impl ThinkingTagSplitter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, chunk: &str) -> Vec<TextSegment> {
        self.pending.push_str(chunk);
        self.drain(false)
    }

    pub(crate) fn finish(&mut self) -> Vec<TextSegment> {
        self.drain(true)
    }

    fn drain(&mut self, flush_all: bool) -> Vec<TextSegment> {
        let mut segments = Vec::new();
        let mut pos = 0usize;
        loop {
            let tag = if self.in_thinking { CLOSE_TAG } else { OPEN_TAG };
            match find_tag(&self.pending, pos, tag, flush_all) {
                Found::At(at) => {
                    self.emit(&mut segments, pos, at);
                    pos = at + tag.len();
                    self.in_thinking = !self.in_thinking;
                }
                Found::Partial(at) => {
                    self.emit(&mut segments, pos, at);
                    pos = at;
                    break;
                }
                Found::None => {
                    let cut = if flush_all {
                        self.pending.len()
                    } else {
                        safe_cut(&self.pending, pos)
                    };
                    self.emit(&mut segments, pos, cut);
                    pos = cut;
                    break;
                }
            }
        }
        self.pending.drain(..pos);
        segments
    }

    fn emit(&self, segments: &mut Vec<TextSegment>, from: usize, to: usize) {
        if to <= from {
            return;
        }
        let text = self.pending[from..to].to_string();
        if self.in_thinking {
            segments.push(TextSegment::Thinking(text));
        } else {
            segments.push(TextSegment::Text(text));
        }
    }
}

fn is_quote(c: char) -> bool {
    matches!(c, '"' | '\'' | '`')
}

fn find_tag(haystack: &str, from: usize, tag: &str, flush_all: bool) -> Found {
    let mut search_from = from;
    while let Some(relative) = haystack[search_from..].find(tag) {
        let at = search_from + relative;
        let preceded_by_quote = haystack[..at].chars().next_back().map(is_quote).unwrap_or(false);
        let end = at + tag.len();
        let following = haystack[end..].chars().next();
        if preceded_by_quote || following.map(is_quote).unwrap_or(false) {
            // Literal tag text inside a string; keep scanning past it.
            search_from = end;
            continue;
        }
        if following.is_none() && !flush_all {
            // Cannot judge quote adjacency until the next chunk arrives.
            return Found::Partial(at);
        }
        return Found::At(at);
    }

    if !flush_all {
        // A tag prefix at the tail may complete in the next chunk.
        let tail_start = haystack.len().saturating_sub(tag.len() - 1).max(from);
        for candidate in tail_start..haystack.len() {
            if !haystack.is_char_boundary(candidate) {
                continue;
            }
            if tag.starts_with(&haystack[candidate..]) {
                return Found::Partial(candidate);
            }
        }
    }
    Found::None
}

/// Flush boundary: withhold a tag-length suffix, on a char boundary.
fn safe_cut(haystack: &str, from: usize) -> usize {
    let mut cut = haystack.len().saturating_sub(CLOSE_TAG.len());
    while cut > 0 && !haystack.is_char_boundary(cut) {
        cut -= 1;
    }
    cut.max(from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(splitter: &mut ThinkingTagSplitter, chunks: &[&str]) -> Vec<TextSegment> {
        let mut segments = Vec::new();
        for chunk in chunks {
            segments.extend(splitter.push(chunk));
        }
        segments.extend(splitter.finish());
        segments
    }

    fn joined(segments: &[TextSegment]) -> (String, String) {
        let mut thinking = String::new();
        let mut text = String::new();
        for segment in segments {
            match segment {
                TextSegment::Thinking(s) => thinking.push_str(s),
                TextSegment::Text(s) => text.push_str(s),
            }
        }
        (thinking, text)
    }

    #[test]
    fn splits_thinking_from_text() {
        let mut splitter = ThinkingTagSplitter::new();
        let segments = collect(
            &mut splitter,
            &["<thinking>let me see</thinking>The answer is 4."],
        );
        let (thinking, text) = joined(&segments);
        assert_eq!(thinking, "let me see");
        assert_eq!(text, "The answer is 4.");
    }

    #[test]
    fn tag_split_across_chunks_is_detected() {
        let mut splitter = ThinkingTagSplitter::new();
        let segments = collect(
            &mut splitter,
            &["<thin", "king>hidden</thi", "nking>visible"],
        );
        let (thinking, text) = joined(&segments);
        assert_eq!(thinking, "hidden");
        assert_eq!(text, "visible");
    }

    #[test]
    fn quoted_tag_is_literal() {
        let mut splitter = ThinkingTagSplitter::new();
        let segments = collect(
            &mut splitter,
            &["the arg was \"<thinking>\" which is not a tag"],
        );
        let (thinking, text) = joined(&segments);
        assert_eq!(thinking, "");
        assert_eq!(text, "the arg was \"<thinking>\" which is not a tag");
    }

    #[test]
    fn unterminated_thinking_flushes_as_thinking() {
        let mut splitter = ThinkingTagSplitter::new();
        let segments = collect(&mut splitter, &["<thinking>never closed"]);
        let (thinking, text) = joined(&segments);
        assert_eq!(thinking, "never closed");
        assert_eq!(text, "");
    }

    #[test]
    fn text_without_tags_passes_through() {
        let mut splitter = ThinkingTagSplitter::new();
        let segments = collect(&mut splitter, &["plain ", "answer ", "text"]);
        let (thinking, text) = joined(&segments);
        assert_eq!(thinking, "");
        assert_eq!(text, "plain answer text");
    }

    #[test]
    fn multibyte_text_never_splits_inside_a_char() {
        let mut splitter = ThinkingTagSplitter::new();
        let segments = collect(&mut splitter, &["答案是<thinking>思考中</thinking>四"]);
        let (thinking, text) = joined(&segments);
        assert_eq!(thinking, "思考中");
        assert_eq!(text, "答案是四");
    }
}
