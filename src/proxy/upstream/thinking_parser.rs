// Finite state machine that separates reasoning wrapped in thinking tags from
// the visible text stream.
//
// Tags may arrive split across arbitrarily small chunks, so partial matches
// are buffered; the buffer never grows past the longest tag literal. Once the
// reasoning budget is exhausted the block is force-closed and the surplus is
// dropped, with visible text resuming after the real closing tag.

const DEFAULT_OPEN_TAG: &str = "<thinking>";
const DEFAULT_CLOSE_TAG: &str = "</thinking>";

/// Rough chars-per-token factor used to translate the token budget into a
/// character cap.
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub enum ThinkingEvent {
    Text(String),
    ThinkingStart,
    ThinkingDelta(String),
    ThinkingEnd,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ThinkingState {
    Normal,
    PotentialOpen,
    InThinking,
    PotentialClose,
}

#[derive(Debug)]
pub struct ThinkingParser {
    state: ThinkingState,
    buffer: String,
    open_tag: String,
    close_tag: String,
    /// Character cap derived from the token budget; 0 disables capping.
    max_chars: usize,
    emitted_chars: usize,
    /// Set once the cap forced a ThinkingEnd; in-tag characters are then
    /// swallowed until the real close tag goes by.
    capped: bool,
    block_open: bool,
    saw_any_thinking: bool,
}

impl ThinkingParser {
    pub fn new(max_tokens: u32) -> Self {
        Self::with_tags(DEFAULT_OPEN_TAG, DEFAULT_CLOSE_TAG, max_tokens)
    }

    /// Custom tag pair; matching is case-sensitive and exact.
    pub fn with_tags(open_tag: &str, close_tag: &str, max_tokens: u32) -> Self {
        Self {
            state: ThinkingState::Normal,
            buffer: String::new(),
            open_tag: open_tag.to_string(),
            close_tag: close_tag.to_string(),
            max_chars: max_tokens as usize * CHARS_PER_TOKEN,
            emitted_chars: 0,
            capped: false,
            block_open: false,
            saw_any_thinking: false,
        }
    }

    /// Whether any thinking block was produced so far.
    pub fn saw_thinking(&self) -> bool {
        self.saw_any_thinking
    }

    /// Whether a block is still open (used to close implicitly at stream end).
    pub fn in_thinking(&self) -> bool {
        self.block_open
    }

    /// Process a text chunk and return resulting events.
    pub fn feed(&mut self, chunk: &str) -> Vec<ThinkingEvent> {
        let mut events: Vec<ThinkingEvent> = Vec::new();
        let mut accum = String::new();

        for ch in chunk.chars() {
            match self.state {
                ThinkingState::Normal => {
                    if ch == '<' {
                        self.flush_accum(&mut accum, &mut events);
                        self.buffer.clear();
                        self.buffer.push(ch);
                        self.state = ThinkingState::PotentialOpen;
                    } else {
                        accum.push(ch);
                    }
                }

                ThinkingState::PotentialOpen => {
                    self.buffer.push(ch);
                    if self.buffer == self.open_tag {
                        self.buffer.clear();
                        self.state = ThinkingState::InThinking;
                        self.saw_any_thinking = true;
                        self.block_open = true;
                        self.capped = false;
                        events.push(ThinkingEvent::ThinkingStart);
                    } else if !self.open_tag.starts_with(self.buffer.as_str()) {
                        // Mismatch: whatever was buffered was ordinary text.
                        accum.push_str(&self.buffer);
                        self.buffer.clear();
                        self.state = ThinkingState::Normal;
                        // The mismatching char may itself begin a new tag.
                        if accum.ends_with('<') {
                            accum.pop();
                            self.flush_accum(&mut accum, &mut events);
                            self.buffer.push('<');
                            self.state = ThinkingState::PotentialOpen;
                        }
                    }
                }

                ThinkingState::InThinking => {
                    if ch == '<' {
                        self.flush_thinking(&mut accum, &mut events);
                        self.buffer.clear();
                        self.buffer.push(ch);
                        self.state = ThinkingState::PotentialClose;
                    } else {
                        accum.push(ch);
                    }
                }

                ThinkingState::PotentialClose => {
                    self.buffer.push(ch);
                    if self.buffer == self.close_tag {
                        self.buffer.clear();
                        self.state = ThinkingState::Normal;
                        if self.block_open {
                            self.block_open = false;
                            events.push(ThinkingEvent::ThinkingEnd);
                        }
                    } else if !self.close_tag.starts_with(self.buffer.as_str()) {
                        accum.push_str(&self.buffer);
                        self.buffer.clear();
                        self.state = ThinkingState::InThinking;
                        if accum.ends_with('<') {
                            accum.pop();
                            self.flush_thinking(&mut accum, &mut events);
                            self.buffer.push('<');
                            self.state = ThinkingState::PotentialClose;
                        }
                    }
                }
            }
        }

        match self.state {
            ThinkingState::Normal | ThinkingState::PotentialOpen => {
                self.flush_accum(&mut accum, &mut events)
            }
            ThinkingState::InThinking | ThinkingState::PotentialClose => {
                self.flush_thinking(&mut accum, &mut events)
            }
        }

        events
    }

    /// Flush remaining buffer at stream end. An unterminated block is closed
    /// implicitly; the caller logs the anomaly.
    pub fn flush(&mut self) -> Vec<ThinkingEvent> {
        let mut events: Vec<ThinkingEvent> = Vec::new();

        if !self.buffer.is_empty() {
            let pending = std::mem::take(&mut self.buffer);
            match self.state {
                ThinkingState::PotentialOpen => events.push(ThinkingEvent::Text(pending)),
                ThinkingState::PotentialClose => self.emit_thinking(pending, &mut events),
                _ => {}
            }
        }

        if self.block_open {
            self.block_open = false;
            events.push(ThinkingEvent::ThinkingEnd);
        }

        self.state = ThinkingState::Normal;
        events
    }

    fn flush_accum(&mut self, accum: &mut String, events: &mut Vec<ThinkingEvent>) {
        if !accum.is_empty() {
            events.push(ThinkingEvent::Text(std::mem::take(accum)));
        }
    }

    fn flush_thinking(&mut self, accum: &mut String, events: &mut Vec<ThinkingEvent>) {
        if !accum.is_empty() {
            let text = std::mem::take(accum);
            self.emit_thinking(text, events);
        }
    }

    /// Emit reasoning text, enforcing the character cap. Over-budget
    /// characters are dropped; the first overflow force-closes the block.
    fn emit_thinking(&mut self, text: String, events: &mut Vec<ThinkingEvent>) {
        if self.max_chars == 0 {
            events.push(ThinkingEvent::ThinkingDelta(text));
            return;
        }
        if self.capped {
            return;
        }

        let remaining = self.max_chars.saturating_sub(self.emitted_chars);
        let char_count = text.chars().count();

        if char_count <= remaining {
            self.emitted_chars += char_count;
            events.push(ThinkingEvent::ThinkingDelta(text));
            return;
        }

        if remaining > 0 {
            let kept: String = text.chars().take(remaining).collect();
            self.emitted_chars = self.max_chars;
            events.push(ThinkingEvent::ThinkingDelta(kept));
        }
        self.capped = true;
        if self.block_open {
            self.block_open = false;
            events.push(ThinkingEvent::ThinkingEnd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(input: &str) -> Vec<ThinkingEvent> {
        let mut p = ThinkingParser::new(4000);
        let mut events = p.feed(input);
        events.extend(p.flush());
        events
    }

    fn collect_thinking(events: &[ThinkingEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ThinkingEvent::ThinkingDelta(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    fn collect_text(events: &[ThinkingEvent]) -> String {
        events
            .iter()
            .filter_map(|e| match e {
                ThinkingEvent::Text(s) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn simple_thinking_block() {
        let events = feed_all("<thinking>content</thinking>");
        assert_eq!(
            events,
            vec![
                ThinkingEvent::ThinkingStart,
                ThinkingEvent::ThinkingDelta("content".into()),
                ThinkingEvent::ThinkingEnd,
            ]
        );
    }

    #[test]
    fn text_before_and_after() {
        let events = feed_all("hello <thinking>inner</thinking> world");
        assert_eq!(collect_text(&events), "hello  world");
        assert_eq!(collect_thinking(&events), "inner");
    }

    #[test]
    fn open_tag_split_across_chunks() {
        let mut p = ThinkingParser::new(4000);
        assert_eq!(p.feed("<thin"), vec![]);
        let events = p.feed("king>hi</thinking>");
        assert_eq!(
            events,
            vec![
                ThinkingEvent::ThinkingStart,
                ThinkingEvent::ThinkingDelta("hi".into()),
                ThinkingEvent::ThinkingEnd,
            ]
        );
    }

    #[test]
    fn close_tag_split_across_chunks() {
        let mut p = ThinkingParser::new(4000);
        let e1 = p.feed("<thinking>data</thin");
        assert_eq!(
            e1,
            vec![
                ThinkingEvent::ThinkingStart,
                ThinkingEvent::ThinkingDelta("data".into()),
            ]
        );
        assert_eq!(p.feed("king>"), vec![ThinkingEvent::ThinkingEnd]);
    }

    #[test]
    fn angle_bracket_not_a_tag() {
        let events = feed_all("x < y and a <b> test");
        assert_eq!(collect_text(&events), "x < y and a <b> test");
        assert_eq!(collect_thinking(&events), "");
    }

    #[test]
    fn consecutive_angle_brackets_restart_matching() {
        // The second '<' must be allowed to begin a real tag.
        let events = feed_all("a <<thinking>t</thinking>b");
        assert_eq!(collect_text(&events), "a <b");
        assert_eq!(collect_thinking(&events), "t");
    }

    #[test]
    fn unclosed_block_closes_implicitly_at_flush() {
        let mut p = ThinkingParser::new(4000);
        let e1 = p.feed("<thinking>unfinished");
        assert_eq!(
            e1,
            vec![
                ThinkingEvent::ThinkingStart,
                ThinkingEvent::ThinkingDelta("unfinished".into()),
            ]
        );
        assert!(p.in_thinking());
        assert_eq!(p.flush(), vec![ThinkingEvent::ThinkingEnd]);
        assert!(!p.in_thinking());
    }

    #[test]
    fn incomplete_open_tag_at_flush_is_text() {
        let mut p = ThinkingParser::new(4000);
        assert_eq!(p.feed("hello <thin"), vec![ThinkingEvent::Text("hello ".into())]);
        assert_eq!(p.flush(), vec![ThinkingEvent::Text("<thin".into())]);
    }

    #[test]
    fn custom_tag_pair() {
        let mut p = ThinkingParser::with_tags("<scratch>", "</scratch>", 4000);
        let mut events = p.feed("<scratch>notes</scratch>answer");
        events.extend(p.flush());
        assert_eq!(collect_thinking(&events), "notes");
        assert_eq!(collect_text(&events), "answer");
    }

    #[test]
    fn cap_force_closes_block_and_drops_surplus() {
        // Budget of 1 token = 4 chars.
        let mut p = ThinkingParser::new(1);
        let mut events = p.feed("<thinking>abcdefgh</thinking>visible");
        events.extend(p.flush());

        assert_eq!(collect_thinking(&events), "abcd");
        assert_eq!(collect_text(&events), "visible");
        let ends = events.iter().filter(|e| **e == ThinkingEvent::ThinkingEnd).count();
        assert_eq!(ends, 1);
    }

    #[test]
    fn cap_applies_across_chunks() {
        let mut p = ThinkingParser::new(1);
        let mut events = p.feed("<thinking>abc");
        events.extend(p.feed("defgh"));
        events.extend(p.feed("</thinking>after"));
        events.extend(p.flush());

        assert_eq!(collect_thinking(&events), "abcd");
        assert_eq!(collect_text(&events), "after");
    }

    #[test]
    fn saw_thinking_flag() {
        let mut p = ThinkingParser::new(4000);
        p.feed("no tags here");
        assert!(!p.saw_thinking());
        p.feed("<thinking>t</thinking>");
        assert!(p.saw_thinking());
    }

    use proptest::prelude::*;

    proptest! {
        /// Removing balanced tag regions from the input yields exactly the
        /// visible stream; the tagged region yields the reasoning stream.
        #[test]
        fn prop_content_extraction(
            before in "[a-zA-Z0-9 ]{0,50}",
            inner in "[a-zA-Z0-9 ]{0,50}",
            after in "[a-zA-Z0-9 ]{0,50}",
        ) {
            let input = format!("{}<thinking>{}</thinking>{}", before, inner, after);
            let events = feed_all(&input);
            prop_assert_eq!(collect_thinking(&events), inner);
            prop_assert_eq!(collect_text(&events), format!("{}{}", before, after));
        }

        /// Splitting the input at any point produces the same streams as
        /// feeding it whole.
        #[test]
        fn prop_chunking_invariance(
            before in "[a-zA-Z0-9 ]{0,30}",
            inner in "[a-zA-Z0-9 ]{0,30}",
            after in "[a-zA-Z0-9 ]{0,30}",
            split_pct in 0u32..100,
        ) {
            let input = format!("{}<thinking>{}</thinking>{}", before, inner, after);

            let reference = feed_all(&input);

            let split_byte = (input.len() as u64 * split_pct as u64 / 100) as usize;
            let split_pos = input
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|&i| i <= split_byte)
                .last()
                .unwrap_or(0);
            let (a, b) = input.split_at(split_pos);

            let mut p = ThinkingParser::new(4000);
            let mut events = p.feed(a);
            events.extend(p.feed(b));
            events.extend(p.flush());

            prop_assert_eq!(collect_thinking(&reference), collect_thinking(&events));
            prop_assert_eq!(collect_text(&reference), collect_text(&events));
        }
    }
}
