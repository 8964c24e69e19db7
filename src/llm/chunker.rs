//! Incremental phrase chunker: splits a growing token stream into
//! independently-synthesizable `PhraseChunk`s (spec §4.7).
//!
//! Splits aggressively enough for low latency, but never mid-sentence,
//! never inside a code block or URL, never after an abbreviation, and
//! never in the middle of a numbered-list marker.

const MIN_WORDS: usize = 4;
const MAX_CHARS: usize = 200;

const ABBREVIATIONS: &[&str] = &[
    "mr.", "mrs.", "ms.", "dr.", "prof.", "sr.", "jr.", "e.g.", "i.e.", "etc.", "vs.", "approx.",
    "dept.", "est.", "inc.", "ltd.", "st.", "ave.", "blvd.",
];

/// One speakable unit handed to the TTS pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhraseChunk {
    pub text: String,
    pub index: u32,
}

pub struct PhraseChunker {
    buffer: String,
    chunk_index: u32,
}

impl Default for PhraseChunker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhraseChunker {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            chunk_index: 0,
        }
    }

    /// `feed(text, isFinal)` from spec §4.7.
    pub fn feed(&mut self, text: &str, is_final: bool) -> Vec<PhraseChunk> {
        self.buffer.push_str(text);
        let mut chunks = Vec::new();
        let mut search_from = 0usize;

        loop {
            if count_fences(&self.buffer) % 2 == 1 {
                // Inside an unclosed code block; stop splitting for now.
                break;
            }
            let buffer_chars: Vec<char> = self.buffer.chars().collect();
            let Some(split) = find_split(&buffer_chars, search_from) else {
                break;
            };

            let candidate: String = buffer_chars[..split].iter().collect();
            let candidate_trimmed = candidate.trim();

            if word_count(candidate_trimmed) >= MIN_WORDS {
                chunks.push(PhraseChunk {
                    text: candidate_trimmed.to_string(),
                    index: self.chunk_index,
                });
                self.chunk_index += 1;
                self.buffer = buffer_chars[split..].iter().collect();
                search_from = 0;
            } else {
                // Too short (e.g. "Sure!") — don't consume it, search past
                // this boundary for a later split that's long enough. This
                // is what prevents the classic "Sure!" infinite loop.
                search_from = split;
            }
        }

        if is_final {
            let trimmed = self.buffer.trim();
            if !trimmed.is_empty() {
                chunks.push(PhraseChunk {
                    text: trimmed.to_string(),
                    index: self.chunk_index,
                });
                self.chunk_index += 1;
                self.buffer.clear();
            }
        }

        chunks
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.chunk_index = 0;
    }
}

fn count_fences(buffer: &str) -> usize {
    buffer.matches("```").count()
}

fn word_count(s: &str) -> usize {
    s.split_whitespace().count()
}

/// Whether `pos` (a `.` char index) sits inside the non-whitespace run
/// that contains the literal substring `http`. This intentionally does
/// not verify a `://` scheme or the URL's trailing boundary — it only
/// checks the word-segment up to `pos`, matching the original behavior
/// this was translated from.
fn is_inside_url(buffer_chars: &[char], pos: usize) -> bool {
    let mut start = pos;
    while start > 0 && !buffer_chars[start - 1].is_whitespace() {
        start -= 1;
    }
    let segment: String = buffer_chars[start..pos].iter().collect::<String>().to_lowercase();
    segment.contains("http")
}

/// Whether the `.` at `dot_pos` terminates a numbered-list marker like `1.`.
fn is_numbered_list_marker(buffer_chars: &[char], dot_pos: usize) -> bool {
    if dot_pos == 0 {
        return false;
    }
    let mut k = dot_pos;
    let mut digits = 0;
    while k > 0 && buffer_chars[k - 1].is_ascii_digit() {
        k -= 1;
        digits += 1;
    }
    digits > 0 && (k == 0 || buffer_chars[k - 1].is_whitespace())
}

/// Whether `buffer_chars[..term_end]` ends with a known abbreviation.
fn is_abbreviation(buffer_chars: &[char], term_end: usize) -> bool {
    for abbr in ABBREVIATIONS {
        let abbr_chars: Vec<char> = abbr.chars().collect();
        if term_end < abbr_chars.len() {
            continue;
        }
        let start = term_end - abbr_chars.len();
        let slice: String = buffer_chars[start..term_end].iter().collect::<String>().to_lowercase();
        if slice == *abbr && (start == 0 || buffer_chars[start - 1].is_whitespace()) {
            return true;
        }
    }
    false
}

fn skip_trailing_whitespace(buffer_chars: &[char], from: usize) -> usize {
    let mut end = from;
    while end < buffer_chars.len() && buffer_chars[end].is_whitespace() {
        end += 1;
    }
    end
}

/// Finds the next split point starting at `search_from`, per the algorithm
/// in spec §4.7. Returns the index immediately after the terminator (and
/// any trailing whitespace).
fn find_split(buffer_chars: &[char], search_from: usize) -> Option<usize> {
    let len = buffer_chars.len();
    let mut i = search_from;
    while i < len {
        let ch = buffer_chars[i];
        if ch == '.' || ch == '!' || ch == '?' {
            let is_ellipsis = ch == '.' && i + 2 < len && buffer_chars[i + 1] == '.' && buffer_chars[i + 2] == '.';
            let term_end = if is_ellipsis { i + 3 } else { i + 1 };

            if ch == '.' && !is_ellipsis {
                if is_inside_url(buffer_chars, i) {
                    i += 1;
                    continue;
                }
                if is_numbered_list_marker(buffer_chars, i) {
                    i += 1;
                    continue;
                }
                if is_abbreviation(buffer_chars, term_end) {
                    i = term_end;
                    continue;
                }

                let prefix_words = word_count(&buffer_chars[..i].iter().collect::<String>());
                let at_end = term_end == len;
                let mut j = term_end;
                while j < len && matches!(buffer_chars[j], '"' | '\'' | ')' | '\u{201d}') {
                    j += 1;
                }
                let has_trailing_ws = j < len && buffer_chars[j].is_whitespace();

                if !((at_end && prefix_words >= MIN_WORDS) || has_trailing_ws) {
                    i = term_end;
                    continue;
                }
            }

            return Some(skip_trailing_whitespace(buffer_chars, term_end));
        }
        i += 1;
    }

    if len > 100 {
        let scan_start = len.min(MAX_CHARS).saturating_sub(1);
        let mut k = scan_start;
        loop {
            if k >= search_from && matches!(buffer_chars[k], ',' | ';' | ':' | '\u{2014}') {
                let prefix_words = word_count(&buffer_chars[..k].iter().collect::<String>());
                if prefix_words >= MIN_WORDS {
                    return Some(skip_trailing_whitespace(buffer_chars, k + 1));
                }
            }
            if k == search_from || k == 0 {
                break;
            }
            k -= 1;
        }
    }

    if len > MAX_CHARS {
        let mut k = MAX_CHARS.saturating_sub(1);
        loop {
            if k >= search_from && buffer_chars[k].is_whitespace() {
                return Some(k + 1);
            }
            if k == search_from || k == 0 {
                break;
            }
            k -= 1;
        }
        return Some(MAX_CHARS.min(len));
    }

    None
}
