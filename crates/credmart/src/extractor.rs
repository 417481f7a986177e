//! One-time code extraction from free-form service messages.
//!
//! A candidate is a standalone run of ASCII digits: the characters on either
//! side must not be word characters (Unicode letters, digits, underscore), so
//! "code12345" and "12345th" are not candidates. Non-ASCII digits count as
//! word characters but never form a code. The text is scanned once and the
//! first candidate of each length is kept; the extractor then picks by its
//! length preference.

/// Pulls a secret code out of an inbound message.
pub trait CodeExtractor: Send + Sync {
    fn extract(&self, text: &str) -> Option<String>;
}

/// Picks the first standalone digit run whose length comes earliest in the
/// preference list.
#[derive(Debug, Clone)]
pub struct DigitCodeExtractor {
    preference: Vec<usize>,
}

impl DigitCodeExtractor {
    pub fn new(preference: Vec<usize>) -> Self {
        Self { preference }
    }

    /// Buyer delivery: 5 digits, else 6, else 4.
    pub fn buyer() -> Self {
        Self::new(vec![5, 6, 4])
    }

    /// Admin monitor: 5 digits only.
    pub fn monitor() -> Self {
        Self::new(vec![5])
    }

    pub fn preference(&self) -> &[usize] {
        &self.preference
    }
}

impl CodeExtractor for DigitCodeExtractor {
    fn extract(&self, text: &str) -> Option<String> {
        let candidates = standalone_digit_runs(text);
        self.preference.iter().find_map(|len| {
            candidates
                .iter()
                .find(|run| run.len() == *len)
                .map(|run| run.to_string())
        })
    }
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Every maximal word made only of ASCII digits, in order of appearance.
fn standalone_digit_runs(text: &str) -> Vec<&str> {
    let mut runs = Vec::new();
    let mut start: Option<usize> = None;

    for (idx, c) in text.char_indices() {
        match (start, is_word_char(c)) {
            (None, true) => start = Some(idx),
            (Some(s), false) => {
                push_if_digits(&mut runs, &text[s..idx]);
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        push_if_digits(&mut runs, &text[s..]);
    }
    runs
}

fn push_if_digits<'a>(runs: &mut Vec<&'a str>, word: &'a str) {
    if !word.is_empty() && word.bytes().all(|b| b.is_ascii_digit()) {
        runs.push(word);
    }
}
