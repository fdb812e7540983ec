//! Incremental `<thinking>` tag parser.
//!
//! Some upstreams emit reasoning as a literal `<thinking>...</thinking>`
//! prefix in plain assistant text. Only the first block is parsed, and only
//! when the response starts with the tag; quoted or code-fenced tags are
//! not delimiters. Tags split across chunks are resolved by holding back a
//! tail one tag-length long.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Thinking,
    Text,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub kind: SegmentKind,
    pub content: String,
}

impl Segment {
    fn thinking(content: impl Into<String>) -> Self {
        Segment {
            kind: SegmentKind::Thinking,
            content: content.into(),
        }
    }

    fn text(content: impl Into<String>) -> Self {
        Segment {
            kind: SegmentKind::Text,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    InThinking,
    AfterThinking,
    Passthrough,
}

const OPEN_TAG: &str = "<thinking>";
const CLOSE_TAG: &str = "</thinking>";
const QUOTE_CHARS: &[char] = &[
    '`', '"', '\'', '\u{201c}', '\u{201d}', '\u{2018}', '\u{2019}', '\u{300c}', '\u{300d}',
    '\u{300e}', '\u{300f}',
];

pub struct ThinkingTagParser {
    buffer: String,
    state: State,
    thinking_extracted: bool,
    strip_leading_newlines: bool,
}

impl Default for ThinkingTagParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkingTagParser {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            state: State::Initial,
            thinking_extracted: false,
            strip_leading_newlines: false,
        }
    }

    pub fn is_thinking_mode(&self) -> bool {
        matches!(self.state, State::InThinking | State::AfterThinking)
    }

    pub fn has_extracted_thinking(&self) -> bool {
        self.thinking_extracted
    }

    /// Feed one chunk; returns the segments that became unambiguous.
    pub fn push_and_parse(&mut self, incoming: &str) -> Vec<Segment> {
        if incoming.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(incoming);

        let mut segments = Vec::new();
        loop {
            match self.state {
                State::Initial => {
                    if !self.resolve_initial() {
                        break;
                    }
                }
                State::InThinking => match self.drain_thinking() {
                    Some(segment) => {
                        if !segment.content.is_empty() {
                            segments.push(segment);
                        }
                    }
                    None => break,
                },
                State::AfterThinking | State::Passthrough => {
                    self.strip_if_pending();
                    if !self.buffer.is_empty() {
                        segments.push(Segment::text(std::mem::take(&mut self.buffer)));
                    }
                    break;
                }
            }
        }
        segments
    }

    /// Stream end. An unclosed thinking block is flushed as thinking with a
    /// warning rather than dropped.
    pub fn flush(&mut self) -> Vec<Segment> {
        let mut segments = Vec::new();
        match self.state {
            State::Initial => {
                if !self.buffer.is_empty() {
                    segments.push(Segment::text(std::mem::take(&mut self.buffer)));
                }
            }
            State::InThinking => {
                if !self.buffer.is_empty() {
                    crate::logger::warn(
                        "thinking",
                        &format!(
                            "thinking block not closed, flushing {} chars as thinking",
                            self.buffer.len()
                        ),
                    );
                    segments.push(Segment::thinking(std::mem::take(&mut self.buffer)));
                }
            }
            State::AfterThinking | State::Passthrough => {
                self.strip_if_pending();
                if !self.buffer.is_empty() {
                    segments.push(Segment::text(std::mem::take(&mut self.buffer)));
                }
            }
        }
        segments
    }

    fn strip_if_pending(&mut self) {
        if self.strip_leading_newlines && !self.buffer.is_empty() {
            let trimmed = self.buffer.trim_start_matches(['\n', '\r']);
            self.buffer = trimmed.to_string();
            self.strip_leading_newlines = false;
        }
    }

    /// Returns true when the state advanced; false means more data needed.
    fn resolve_initial(&mut self) -> bool {
        let stripped = self.buffer.trim_start();
        let leading_ws = self.buffer.len() - stripped.len();

        if stripped.len() < OPEN_TAG.len() {
            if !stripped.is_empty() && !OPEN_TAG.starts_with(stripped) {
                self.state = State::Passthrough;
                return true;
            }
            // Possibly a tag prefix (or only whitespace so far): wait.
            return false;
        }

        if stripped.starts_with(OPEN_TAG) {
            self.buffer.drain(..leading_ws + OPEN_TAG.len());
            self.state = State::InThinking;
        } else {
            self.state = State::Passthrough;
        }
        true
    }

    /// Returns the next thinking segment, or None when more data is needed.
    fn drain_thinking(&mut self) -> Option<Segment> {
        match self.find_real_close_tag() {
            Some(pos) => {
                let thinking = self.buffer[..pos].to_string();
                let after = self.buffer[pos + CLOSE_TAG.len()..]
                    .trim_start_matches(['\r', '\n'])
                    .to_string();
                self.buffer = after;
                self.strip_leading_newlines = true;
                self.state = State::AfterThinking;
                self.thinking_extracted = true;
                Some(Segment::thinking(thinking))
            }
            None => {
                // Hold back a possible partial close tag.
                let safe_len = self.buffer.len().saturating_sub(CLOSE_TAG.len() - 1);
                let boundary = floor_char_boundary(&self.buffer, safe_len);
                if boundary > 0 {
                    let emit: String = self.buffer.drain(..boundary).collect();
                    return Some(Segment::thinking(emit));
                }
                None
            }
        }
    }

    fn find_real_close_tag(&self) -> Option<usize> {
        let mut search_start = 0;
        loop {
            let pos = self.buffer[search_start..].find(CLOSE_TAG)? + search_start;

            if self.is_quoted_tag(pos) {
                search_start = pos + 1;
                continue;
            }

            let after = pos + CLOSE_TAG.len();
            if after < self.buffer.len() {
                let next = self.buffer[after..].chars().next();
                if matches!(next, Some('\n') | Some('\r')) {
                    return Some(pos);
                }
                // A close tag deep inside running text is likely quoted;
                // near the buffer edge it may just be a chunk boundary.
                if self.buffer.len() - after > 10 {
                    search_start = pos + 1;
                    continue;
                }
            }
            return Some(pos);
        }
    }

    fn is_quoted_tag(&self, tag_pos: usize) -> bool {
        if tag_pos == 0 {
            return false;
        }
        let before = &self.buffer[..tag_pos];
        if let Some(prev) = before.chars().last() {
            if QUOTE_CHARS.contains(&prev) {
                return true;
            }
        }
        // An odd number of backticks before the tag means we are inside a
        // code span.
        before.matches('`').count() % 2 == 1
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parser: &mut ThinkingTagParser, chunks: &[&str]) -> Vec<Segment> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(parser.push_and_parse(chunk));
        }
        out.extend(parser.flush());
        out
    }

    fn joined(segments: &[Segment], kind: SegmentKind) -> String {
        segments
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.content.as_str())
            .collect()
    }

    #[test]
    fn single_chunk_thinking_then_text() {
        let mut parser = ThinkingTagParser::new();
        let segments = collect(&mut parser, &["<thinking>deep thought</thinking>\n\nanswer"]);
        assert_eq!(joined(&segments, SegmentKind::Thinking), "deep thought");
        assert_eq!(joined(&segments, SegmentKind::Text), "answer");
        assert!(parser.has_extracted_thinking());
    }

    #[test]
    fn tag_split_across_chunks() {
        let mut parser = ThinkingTagParser::new();
        let segments = collect(
            &mut parser,
            &["<think", "ing>ab", "c</thin", "king>\nrest"],
        );
        assert_eq!(joined(&segments, SegmentKind::Thinking), "abc");
        assert_eq!(joined(&segments, SegmentKind::Text), "rest");
    }

    #[test]
    fn chunking_never_changes_the_result() {
        let input = "<thinking>X</thinking>\nY";
        for split in 1..input.len() {
            let mut parser = ThinkingTagParser::new();
            let segments = collect(&mut parser, &[&input[..split], &input[split..]]);
            assert_eq!(joined(&segments, SegmentKind::Thinking), "X", "split={split}");
            assert_eq!(joined(&segments, SegmentKind::Text), "Y", "split={split}");
        }
    }

    #[test]
    fn response_not_starting_with_tag_is_passthrough() {
        let mut parser = ThinkingTagParser::new();
        let segments = collect(&mut parser, &["hello <thinking>not real</thinking>"]);
        assert!(joined(&segments, SegmentKind::Thinking).is_empty());
        assert_eq!(
            joined(&segments, SegmentKind::Text),
            "hello <thinking>not real</thinking>"
        );
        assert!(!parser.has_extracted_thinking());
    }

    #[test]
    fn quoted_close_tag_is_skipped() {
        let mut parser = ThinkingTagParser::new();
        let segments = collect(
            &mut parser,
            &["<thinking>the literal `</thinking>` token is quoted</thinking>\ntext"],
        );
        assert_eq!(
            joined(&segments, SegmentKind::Thinking),
            "the literal `</thinking>` token is quoted"
        );
        assert_eq!(joined(&segments, SegmentKind::Text), "text");
    }

    #[test]
    fn unclosed_block_flushes_as_thinking() {
        let mut parser = ThinkingTagParser::new();
        let segments = collect(&mut parser, &["<thinking>never closed"]);
        assert_eq!(joined(&segments, SegmentKind::Thinking), "never closed");
        assert!(joined(&segments, SegmentKind::Text).is_empty());
    }

    #[test]
    fn only_first_block_is_parsed() {
        let mut parser = ThinkingTagParser::new();
        let segments = collect(
            &mut parser,
            &["<thinking>one</thinking>\nafter <thinking>two</thinking>"],
        );
        assert_eq!(joined(&segments, SegmentKind::Thinking), "one");
        assert_eq!(
            joined(&segments, SegmentKind::Text),
            "after <thinking>two</thinking>"
        );
    }

    #[test]
    fn leading_whitespace_before_tag_is_tolerated() {
        let mut parser = ThinkingTagParser::new();
        let segments = collect(&mut parser, &["  \n<thinking>t</thinking>\nbody"]);
        assert_eq!(joined(&segments, SegmentKind::Thinking), "t");
        assert_eq!(joined(&segments, SegmentKind::Text), "body");
    }
}
