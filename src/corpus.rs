//! Baike QA Corpus
//!
//! Reads the Baidu Baike QA dump (one JSON object per line) and turns each
//! record into a matching/mismatching answer pair:
//!
//! 1. Normalize `desc` (question) and `answer`: split on whitespace and
//!    rejoin the pieces with `。`. Drop records where either is empty.
//! 2. The negative for record `i` is the answer of record `i + 1` (the last
//!    record wraps around to the first).
//! 3. Flip a coin per record. On `r <= 0.5` the true answer stays in slot 0
//!    (label 0); otherwise the two candidates are swapped (label 1).
//!
//! ```text
//! answers  [a0, a1, a2]
//! negative [a1, a2, a0]
//! coin      ≤.5  >.5  ≤.5
//! pairs    (a0,a1) (a2,a1) (a2,a0)    labels 0, 1, 0
//! ```
//!
//! Each split draws its coins from its own `StdRng`, so the labels of one
//! split never depend on how many records another split consumed.

use crate::error::{Result, TrainError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

pub const TRAIN_FILE: &str = "baike_qa_train.json";
pub const HELD_OUT_FILE: &str = "baike_qa_test.json";

/// One raw question with two candidate answers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextExample {
    pub question: String,
    pub candidates: [String; 2],
    /// Index of the true answer in `candidates`
    pub label: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub fn name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        }
    }

    /// Per-split offset mixed into the run seed
    fn seed_offset(self) -> u64 {
        match self {
            Split::Train => 0,
            Split::Valid => 1,
            Split::Test => 2,
        }
    }
}

/// Source of labeled text examples
pub trait CorpusProvider {
    fn load(&self, split: Split) -> Result<Vec<TextExample>>;
}

#[derive(Deserialize)]
struct RawRecord {
    #[serde(default)]
    desc: String,
    #[serde(default)]
    answer: String,
}

/// The Baike QA files under one data directory
#[derive(Clone, Debug)]
pub struct BaikeQaCorpus {
    data_dir: PathBuf,
    seed: u64,
}

impl BaikeQaCorpus {
    pub fn new(data_dir: impl Into<PathBuf>, seed: u64) -> Self {
        Self {
            data_dir: data_dir.into(),
            seed,
        }
    }

    pub fn path(&self, split: Split) -> PathBuf {
        match split {
            Split::Train => self.data_dir.join(TRAIN_FILE),
            Split::Valid | Split::Test => self.data_dir.join(HELD_OUT_FILE),
        }
    }

    /// Normalized (question, answer) pairs of a file, empty records dropped
    pub fn read_pairs(&self, split: Split) -> Result<Vec<(String, String)>> {
        let path = self.path(split);
        let reader = BufReader::new(File::open(&path)?);
        let mut pairs = Vec::new();
        let mut dropped = 0usize;

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: RawRecord = serde_json::from_str(&line).map_err(|e| {
                TrainError::Data(format!("{}:{}: {}", path.display(), line_no + 1, e))
            })?;
            let question = normalize(&record.desc);
            let answer = normalize(&record.answer);
            if question.is_empty() || answer.is_empty() {
                dropped += 1;
                continue;
            }
            pairs.push((question, answer));
        }

        if dropped > 0 {
            tracing::debug!(split = split.name(), dropped, "dropped records with an empty field");
        }
        Ok(pairs)
    }
}

impl CorpusProvider for BaikeQaCorpus {
    fn load(&self, split: Split) -> Result<Vec<TextExample>> {
        let pairs = self.read_pairs(split)?;
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(split.seed_offset()));
        let examples = corrupt_pairs(pairs, &mut rng);
        tracing::info!(split = split.name(), examples = examples.len(), "loaded corpus split");
        Ok(examples)
    }
}

/// Join whitespace-separated pieces with `。`
pub fn normalize(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join("。")
}

/// Pair every question with its answer and the next record's answer, in random order
pub fn corrupt_pairs<R: Rng + ?Sized>(pairs: Vec<(String, String)>, rng: &mut R) -> Vec<TextExample> {
    let n = pairs.len();
    let answers: Vec<String> = pairs.iter().map(|(_, a)| a.clone()).collect();

    pairs
        .into_iter()
        .enumerate()
        .map(|(i, (question, answer))| {
            let negative = answers[(i + 1) % n].clone();
            if rng.random::<f32>() <= 0.5 {
                TextExample {
                    question,
                    candidates: [answer, negative],
                    label: 0,
                }
            } else {
                TextExample {
                    question,
                    candidates: [negative, answer],
                    label: 1,
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pairs(n: usize) -> Vec<(String, String)> {
        (0..n).map(|i| (format!("q{}", i), format!("a{}", i))).collect()
    }

    #[test]
    fn test_normalize_joins_pieces() {
        assert_eq!(normalize("  怎么 做\t蛋糕 \n"), "怎么。做。蛋糕");
        assert_eq!(normalize("   "), "");
    }

    #[test]
    fn test_true_answer_sits_at_label() {
        let mut rng = StdRng::seed_from_u64(9);
        let examples = corrupt_pairs(pairs(50), &mut rng);
        let mut seen = [false; 2];
        for (i, ex) in examples.iter().enumerate() {
            assert_eq!(ex.candidates[ex.label], format!("a{}", i));
            assert_eq!(ex.candidates[1 - ex.label], format!("a{}", (i + 1) % 50));
            seen[ex.label] = true;
        }
        assert!(seen[0] && seen[1]);
    }

    #[test]
    fn test_single_record_pairs_with_itself() {
        let mut rng = StdRng::seed_from_u64(0);
        let examples = corrupt_pairs(pairs(1), &mut rng);
        assert_eq!(examples[0].candidates, ["a0".to_string(), "a0".to_string()]);
    }

    #[test]
    fn test_load_drops_empty_and_seeds_per_split() {
        let dir = std::env::temp_dir().join(format!("baike-gpt-corpus-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let mut file = File::create(dir.join(HELD_OUT_FILE)).unwrap();
        for i in 0..20 {
            writeln!(file, r#"{{"desc": "问题 {}", "answer": "答案{}"}}"#, i, i).unwrap();
        }
        writeln!(file, r#"{{"desc": " ", "answer": "孤立"}}"#).unwrap();
        writeln!(file, r#"{{"desc": "没有答案"}}"#).unwrap();
        drop(file);

        let corpus = BaikeQaCorpus::new(&dir, 42);
        let valid = corpus.load(Split::Valid).unwrap();
        let again = corpus.load(Split::Valid).unwrap();
        let test = corpus.load(Split::Test).unwrap();

        assert_eq!(valid.len(), 20);
        assert_eq!(valid[3].question, "问题。3");
        assert_eq!(valid, again);
        let valid_labels: Vec<usize> = valid.iter().map(|e| e.label).collect();
        let test_labels: Vec<usize> = test.iter().map(|e| e.label).collect();
        assert_ne!(valid_labels, test_labels);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_malformed_line_is_a_data_error() {
        let dir = std::env::temp_dir().join(format!("baike-gpt-corpus-bad-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(TRAIN_FILE), "{\"desc\": \"q\", \"answer\": \"a\"}\nnot json\n").unwrap();
        let result = BaikeQaCorpus::new(&dir, 1).load(Split::Train);
        assert!(matches!(result, Err(TrainError::Data(msg)) if msg.contains(":2:")));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
