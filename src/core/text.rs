//! Utterance normalization shared by the transition rules, the echo filter
//! and the session's trivial-utterance checks.

use std::collections::HashSet;

/// Filler tokens that never count as a user turn on their own.
const FILLERS: &[&str] = &[
    "um", "uh", "umm", "uhh", "hmm", "hm", "mm", "mhm", "er", "erm", "ah", "oh",
];

/// Lowercase, strip punctuation (apostrophes are kept inside words) and
/// collapse whitespace.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;

    for ch in text.chars() {
        if ch.is_alphanumeric() || ch == '\'' {
            if pending_space && !out.is_empty() {
                out.push(' ');
            }
            pending_space = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_space = true;
        }
    }

    out.trim_matches('\'').to_string()
}

/// Normalized words of `text`, in order.
pub fn words(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .map(|w| w.trim_matches('\'').to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Distinct normalized words of `text`.
pub fn word_set(text: &str) -> HashSet<String> {
    words(text).into_iter().collect()
}

/// Whether `phrase` occurs in `haystack` as a contiguous run of whole words.
pub fn contains_phrase(haystack: &[String], phrase: &[String]) -> bool {
    if phrase.is_empty() || phrase.len() > haystack.len() {
        return false;
    }
    haystack.windows(phrase.len()).any(|window| window == phrase)
}

/// An utterance made only of fillers or single characters.
pub fn is_trivial(text: &str) -> bool {
    let words = words(text);
    if words.is_empty() {
        return true;
    }
    words
        .iter()
        .all(|w| w.chars().count() <= 1 || FILLERS.contains(&w.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_punctuation_and_case() {
        assert_eq!(normalize("  Yes, PLEASE!  "), "yes please");
        assert_eq!(normalize("I'm   here..."), "i'm here");
        assert_eq!(normalize("'quoted'"), "quoted");
        assert_eq!(normalize("?!"), "");
    }

    #[test]
    fn test_words_and_phrase_matching() {
        let haystack = words("Could you hold on a second?");
        assert!(contains_phrase(&haystack, &words("hold on")));
        assert!(!contains_phrase(&haystack, &words("on hold")));
        assert!(!contains_phrase(&haystack, &[]));
    }

    #[test]
    fn test_trivial_utterances() {
        assert!(is_trivial(""));
        assert!(is_trivial("Um..."));
        assert!(is_trivial("uh, hmm"));
        assert!(is_trivial("a"));
        assert!(!is_trivial("yes"));
        assert!(!is_trivial("um yes"));
    }
}
