//! Incremental segment parser
//!
//! Splits the assistant's raw output stream into ordered segments of the
//! shape `[S]speech[/S][B]board[/B]`, with the board block optional. The
//! parser is fed arbitrary chunks as they arrive from the LLM and emits a
//! segment as soon as it is complete, so TTS can start before the stream
//! ends. Text outside the tags is framing and is discarded.

/// One assistant-emission unit: an utterance plus optional board markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Contiguous id starting at 0 within one assistant turn
    pub id: u32,
    /// Spoken text, always non-empty
    pub speech: String,
    /// Board markup, empty when the segment has no board block
    pub board: String,
}

const SPEECH_OPEN: &str = "[S]";
const SPEECH_CLOSE: &str = "[/S]";
const BOARD_OPEN: &str = "[B]";
const BOARD_CLOSE: &str = "[/B]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Scanning for the next `[S]`
    Outside,
    /// Inside `[S]...`, scanning for `[/S]`
    Speech,
    /// Speech closed; a `[B]` may still follow
    AwaitBoard,
    /// Speech closed and the board option is ruled out; waiting for `[S]` or end
    AwaitSpeech,
    /// Inside `[B]...`, scanning for `[/B]`
    Board,
}

/// Streaming parser state for one assistant turn.
#[derive(Debug)]
pub struct SegmentParser {
    buf: String,
    mode: Mode,
    next_id: u32,
    pending_speech: Option<String>,
}

impl SegmentParser {
    pub fn new() -> Self {
        Self { buf: String::new(), mode: Mode::Outside, next_id: 0, pending_speech: None }
    }

    /// Feed a chunk and collect every segment completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<Segment> {
        self.buf.push_str(chunk);
        let mut out = Vec::new();

        loop {
            match self.mode {
                Mode::Outside => {
                    if let Some(i) = self.buf.find(SPEECH_OPEN) {
                        self.buf.drain(..i + SPEECH_OPEN.len());
                        self.mode = Mode::Speech;
                    } else {
                        self.retain_partial_tag(SPEECH_OPEN);
                        break;
                    }
                }
                Mode::Speech => {
                    if let Some(i) = self.buf.find(SPEECH_CLOSE) {
                        let speech = self.buf[..i].trim().to_string();
                        self.buf.drain(..i + SPEECH_CLOSE.len());
                        self.pending_speech = Some(speech);
                        self.mode = Mode::AwaitBoard;
                    } else {
                        break;
                    }
                }
                Mode::AwaitBoard => {
                    let ws = self.buf.len() - self.buf.trim_start().len();
                    let ahead = &self.buf[ws..];
                    if ahead.is_empty() {
                        break;
                    }
                    if ahead.starts_with(BOARD_OPEN) {
                        self.buf.drain(..ws + BOARD_OPEN.len());
                        self.mode = Mode::Board;
                    } else if ahead.len() < BOARD_OPEN.len() && BOARD_OPEN.starts_with(ahead) {
                        // Could still become `[B]` with more input
                        break;
                    } else {
                        self.mode = Mode::AwaitSpeech;
                    }
                }
                Mode::AwaitSpeech => {
                    if let Some(i) = self.buf.find(SPEECH_OPEN) {
                        out.extend(self.emit(String::new()));
                        self.buf.drain(..i);
                        self.mode = Mode::Outside;
                    } else {
                        self.retain_partial_tag(SPEECH_OPEN);
                        break;
                    }
                }
                Mode::Board => {
                    if let Some(i) = self.buf.find(BOARD_CLOSE) {
                        let board = self.buf[..i].trim().to_string();
                        self.buf.drain(..i + BOARD_CLOSE.len());
                        out.extend(self.emit(board));
                        self.mode = Mode::Outside;
                    } else {
                        break;
                    }
                }
            }
        }

        out
    }

    /// Flush the residual state at end of stream.
    ///
    /// A pending speech without a board becomes a board-less segment; an
    /// unclosed board emits with whatever arrived before the stream ended.
    /// A partial speech (no `[/S]` seen) is discarded.
    pub fn finalize(mut self) -> Option<Segment> {
        match self.mode {
            Mode::AwaitBoard | Mode::AwaitSpeech => self.emit(String::new()),
            Mode::Board => {
                let board = std::mem::take(&mut self.buf).trim().to_string();
                self.emit(board)
            }
            Mode::Outside | Mode::Speech => None,
        }
    }

    fn emit(&mut self, board: String) -> Option<Segment> {
        let speech = self.pending_speech.take()?;
        if speech.is_empty() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        Some(Segment { id, speech, board })
    }

    /// Drop scanned-past framing but keep a tail that could still grow into
    /// `tag` on the next feed.
    fn retain_partial_tag(&mut self, tag: &str) {
        for keep in (1..tag.len()).rev() {
            if self.buf.len() >= keep && self.buf.is_char_boundary(self.buf.len() - keep) {
                let tail = &self.buf[self.buf.len() - keep..];
                if tag.starts_with(tail) {
                    self.buf.drain(..self.buf.len() - keep);
                    return;
                }
            }
        }
        self.buf.clear();
    }
}

impl Default for SegmentParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(chunks: &[&str]) -> Vec<Segment> {
        let mut parser = SegmentParser::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(parser.feed(chunk));
        }
        out.extend(parser.finalize());
        out
    }

    #[test]
    fn test_speech_with_board() {
        let segments = parse_all(&["[S]太阳系有八大行星。[/S][B]:::step{n=1} 行星\n水星\n:::[/B]"]);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].id, 0);
        assert_eq!(segments[0].speech, "太阳系有八大行星。");
        assert_eq!(segments[0].board, ":::step{n=1} 行星\n水星\n:::");
    }

    #[test]
    fn test_consecutive_speech_only_segments() {
        let segments = parse_all(&["[S]a[/S][S]b[/S]"]);
        assert_eq!(
            segments,
            vec![
                Segment { id: 0, speech: "a".into(), board: String::new() },
                Segment { id: 1, speech: "b".into(), board: String::new() },
            ]
        );
    }

    #[test]
    fn test_garbage_around_speech_is_framing() {
        let segments = parse_all(&["garbage [S] hi [/S] more garbage"]);
        assert_eq!(segments, vec![Segment { id: 0, speech: "hi".into(), board: String::new() }]);
    }

    #[test]
    fn test_chunking_does_not_change_output() {
        let text = "[S]第一句。[/S][B]:::note{color=blue}\n要点\n:::[/B][S]第二句。[/S]";
        let whole = parse_all(&[text]);

        // Byte-at-a-time chunking must produce the same segments
        let mut parser = SegmentParser::new();
        let mut split = Vec::new();
        let mut buf = String::new();
        for ch in text.chars() {
            buf.clear();
            buf.push(ch);
            split.extend(parser.feed(&buf));
        }
        split.extend(parser.finalize());

        assert_eq!(whole, split);
        assert_eq!(whole.len(), 2);
        assert_eq!(whole[1].id, 1);
    }

    #[test]
    fn test_tag_split_across_chunks() {
        let segments = parse_all(&["[S]你好[/", "S][", "B]板书[/B", "]"]);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].speech, "你好");
        assert_eq!(segments[0].board, "板书");
    }

    #[test]
    fn test_unclosed_board_flushes_on_finalize() {
        let segments = parse_all(&["[S]讲解[/S][B]:::step{n=1} 步骤"]);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].board, ":::step{n=1} 步骤");
    }

    #[test]
    fn test_partial_speech_discarded() {
        assert!(parse_all(&["[S]没说完"]).is_empty());
    }

    #[test]
    fn test_empty_speech_not_emitted() {
        let segments = parse_all(&["[S]  [/S][S]好[/S]"]);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].id, 0);
        assert_eq!(segments[0].speech, "好");
    }

    #[test]
    fn test_board_after_interstitial_text_not_attached() {
        // Once a non-board character follows `[/S]`, a later `[B]` is framing.
        let segments = parse_all(&["[S]a[/S] x [B]late[/B][S]b[/S]"]);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].board, "");
        assert_eq!(segments[1].speech, "b");
    }

    #[test]
    fn test_byte_preserving_concat() {
        let chunks = ["[S] 早上好", "。[/S]", "[B] 黑板 ", "[/B]"];
        let segments = parse_all(&chunks);
        let joined: String = segments.iter().map(|s| format!("{}{}", s.speech, s.board)).collect();
        assert_eq!(joined, "早上好。黑板");
    }
}
