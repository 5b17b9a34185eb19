//! Character Tokenizer
//!
//! The QA corpus is Chinese, where a single character already carries most
//! of a word's meaning, so text is tokenized one character at a time against
//! a frequency-ranked vocabulary.
//!
//! ## Vocabulary
//!
//! [`CharTokenizer::build`] counts every character of every question and
//! answer, keeps the `max_size` most frequent, and numbers them from 1 in
//! order of decreasing frequency (ties keep first-appearance order). Id 0 is
//! reserved for characters outside the vocabulary.
//!
//! ```text
//! "好好学习" + "学好"  →  {好: 1, 学: 2, 习: 3}
//! encode("好学问")     →  [1, 2, 0]
//! ```
//!
//! The vocabulary is stored as a flat JSON object `{"char": id, ...}`.
//!
//! ## Special Tokens
//!
//! [`vocab_size`](Tokenizer::vocab_size) is `max_id + 1`, so the special
//! `start`/`delimiter`/`classify` ids placed at `vocab_size..vocab_size + 3`
//! never collide with a real character.

use crate::error::Result;
use rayon::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Id assigned to characters missing from the vocabulary
pub const UNKNOWN_ID: usize = 0;

/// Text to token-id conversion
pub trait Tokenizer: Sync {
    fn encode(&self, text: &str) -> Vec<usize>;

    /// One past the largest id `encode` can return
    fn vocab_size(&self) -> usize;

    /// Encode many texts in parallel
    fn encode_all(&self, texts: &[String]) -> Vec<Vec<usize>> {
        texts.par_iter().map(|t| self.encode(t)).collect()
    }
}

/// Frequency-ranked character vocabulary
#[derive(Clone, Debug, PartialEq)]
pub struct CharTokenizer {
    vocab: HashMap<char, usize>,
    size: usize,
}

impl CharTokenizer {
    /// Build a vocabulary from raw texts, keeping the `max_size` most frequent characters
    pub fn build<'a, I>(texts: I, max_size: usize) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut counts: HashMap<char, usize> = HashMap::new();
        let mut first_seen: Vec<char> = Vec::new();
        for text in texts {
            for ch in text.chars() {
                let count = counts.entry(ch).or_insert_with(|| {
                    first_seen.push(ch);
                    0
                });
                *count += 1;
            }
        }

        // Stable sort keeps first-appearance order among equal counts
        first_seen.sort_by(|a, b| counts[b].cmp(&counts[a]));
        let vocab: HashMap<char, usize> = first_seen
            .into_iter()
            .take(max_size)
            .enumerate()
            .map(|(i, ch)| (ch, i + 1))
            .collect();

        Self::from_map(vocab)
    }

    fn from_map(vocab: HashMap<char, usize>) -> Self {
        let size = vocab.values().copied().max().unwrap_or(UNKNOWN_ID) + 1;
        Self { vocab, size }
    }

    pub fn id(&self, ch: char) -> usize {
        self.vocab.get(&ch).copied().unwrap_or(UNKNOWN_ID)
    }

    /// Map ids back to characters, skipping unknown and out-of-range ids
    pub fn decode(&self, ids: &[usize]) -> String {
        let reverse: HashMap<usize, char> = self.vocab.iter().map(|(&c, &id)| (id, c)).collect();
        ids.iter().filter_map(|id| reverse.get(id)).collect()
    }

    /// Number of characters in the vocabulary
    pub fn len(&self) -> usize {
        self.vocab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vocab.is_empty()
    }

    /// Save as a JSON `{char: id}` object
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let map: HashMap<String, usize> =
            self.vocab.iter().map(|(c, &id)| (c.to_string(), id)).collect();
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string(&map)?)?;
        Ok(())
    }

    /// Load a JSON `{char: id}` object
    ///
    /// Keys longer than one character are ignored.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        let map: HashMap<String, usize> = serde_json::from_str(&json)?;
        let vocab = map
            .into_iter()
            .filter_map(|(key, id)| {
                let mut chars = key.chars();
                match (chars.next(), chars.next()) {
                    (Some(ch), None) => Some((ch, id)),
                    _ => None,
                }
            })
            .collect();
        Ok(Self::from_map(vocab))
    }
}

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Vec<usize> {
        text.chars().map(|ch| self.id(ch)).collect()
    }

    fn vocab_size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_ranks_by_frequency() {
        let tokenizer = CharTokenizer::build(["好好学习", "学好"], 10);
        assert_eq!(tokenizer.id('好'), 1);
        assert_eq!(tokenizer.id('学'), 2);
        assert_eq!(tokenizer.id('习'), 3);
        assert_eq!(tokenizer.vocab_size(), 4);
    }

    #[test]
    fn test_ties_keep_first_appearance() {
        let tokenizer = CharTokenizer::build(["cab", "bca"], 10);
        assert_eq!(tokenizer.encode("cab"), vec![1, 2, 3]);
    }

    #[test]
    fn test_max_size_truncates() {
        let tokenizer = CharTokenizer::build(["aaabbc"], 2);
        assert_eq!(tokenizer.len(), 2);
        assert_eq!(tokenizer.encode("abc"), vec![1, 2, UNKNOWN_ID]);
        assert_eq!(tokenizer.vocab_size(), 3);
    }

    #[test]
    fn test_decode_skips_unknown() {
        let tokenizer = CharTokenizer::build(["问答"], 10);
        let ids = tokenizer.encode("问?答");
        assert_eq!(ids, vec![1, 0, 2]);
        assert_eq!(tokenizer.decode(&ids), "问答");
    }

    #[test]
    fn test_save_load_roundtrip() {
        let path = std::env::temp_dir().join(format!("baike-gpt-vocab-{}.json", std::process::id()));
        let tokenizer = CharTokenizer::build(["百度知道", "知道了"], 100);
        tokenizer.save(&path).unwrap();
        let loaded = CharTokenizer::load(&path).unwrap();
        assert_eq!(loaded, tokenizer);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_empty_vocabulary() {
        let tokenizer = CharTokenizer::build(std::iter::empty::<&str>(), 10);
        assert!(tokenizer.is_empty());
        assert_eq!(tokenizer.vocab_size(), 1);
        assert_eq!(tokenizer.encode("x"), vec![0]);
    }
}
