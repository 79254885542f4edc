/// Marks that end a sentence, including the full-width forms.
const TERMINALS: &[char] = &['.', '!', '?', '…', '。', '！', '？', '．'];

/// Closing marks that stay attached to the sentence they end.
const CLOSERS: &[char] = &['"', '\'', ')', ']', '”', '’', '」', '』'];

fn is_terminal(ch: char) -> bool {
    TERMINALS.contains(&ch)
}

fn is_full_width(ch: char) -> bool {
    matches!(ch, '。' | '！' | '？' | '．')
}

/// Accumulates streamed text and hands back complete sentences.
///
/// A sentence ends at terminal punctuation that is either the last thing
/// received so far or followed by whitespace. Full-width terminals end a
/// sentence without needing a space. A trailing `.` right after a digit is
/// held back until more text arrives, since it may be a decimal point.
#[derive(Debug, Default)]
pub struct SentenceSplitter {
    buffer: String,
}

impl SentenceSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk and return every sentence it completes, in order.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut sentences = Vec::new();
        while let Some(end) = self.boundary() {
            let sentence: String = self.buffer.drain(..end).collect();
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }
        sentences
    }

    /// Whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn boundary(&self) -> Option<usize> {
        let chars: Vec<(usize, char)> = self.buffer.char_indices().collect();
        let mut i = 0;
        while i < chars.len() {
            let (_, ch) = chars[i];
            if !is_terminal(ch) {
                i += 1;
                continue;
            }

            let mut j = i + 1;
            while j < chars.len() && (is_terminal(chars[j].1) || CLOSERS.contains(&chars[j].1)) {
                j += 1;
            }

            if j == chars.len() {
                let decimal = ch == '.' && j == i + 1 && i > 0 && chars[i - 1].1.is_ascii_digit();
                return (!decimal).then_some(self.buffer.len());
            }

            let last = chars[j - 1].1;
            if chars[j].1.is_whitespace() || is_full_width(last) || is_full_width(ch) {
                return Some(chars[j].0);
            }
            i = j;
        }
        None
    }
}
