//! Batch Encoder
//!
//! Packs (context, candidate A, candidate B) triples into the fixed-shape
//! tensors the model consumes. Each example becomes two rows, one per
//! candidate:
//!
//! ```text
//! row j = [start] + context[..max_half] + [delimiter] + candidate_j[..max_half] + [classify]
//! max_half = n_ctx / 2 - 2
//! ```
//!
//! A model whose context was fitted to the data pins `max_len`, and that
//! value replaces `max_half`.
//!
//! Rows are zero-padded to `n_ctx` with mask 0. Every slot also carries a
//! position id `n_vocab + 3 + p`, pointing at the position rows of the shared
//! embedding table.
//!
//! ## Layout
//!
//! ```text
//! tokens [N, 2, n_ctx, 2]   (token id, position id)
//! mask   [N, 2, n_ctx]      1.0 for packed slots, 0.0 for padding
//! ```
//!
//! ## Example
//!
//! ```rust
//! use baike_gpt::encoder::BatchEncoder;
//!
//! let encoder = BatchEncoder::new(5, 8).unwrap();
//! let batch = encoder.encode(&[vec![1, 2]], &[vec![3]], &[vec![4]]);
//! assert_eq!(batch.row_token_ids(0), vec![5, 1, 2, 6, 3, 7, 0, 0]);
//! ```

use crate::config::{ModelConfig, N_SPECIAL};
use crate::error::ConfigError;
use std::ops::Range;

/// A tokenized example: a question and two candidate answers
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QaExample {
    pub context: Vec<usize>,
    pub candidates: [Vec<usize>; 2],
    /// Index of the true answer in `candidates`
    pub label: usize,
}

/// Packed model input for `len()` examples
#[derive(Clone, Debug, PartialEq)]
pub struct EncodedBatch {
    /// `[N, 2, n_ctx, 2]` flattened: (token id, position id) per slot
    pub tokens: Vec<usize>,
    /// `[N, 2, n_ctx]` flattened
    pub mask: Vec<f32>,
    pub n_ctx: usize,
}

impl EncodedBatch {
    /// Number of examples (pairs of rows)
    pub fn len(&self) -> usize {
        self.mask.len() / (2 * self.n_ctx)
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    /// Number of packed rows, `2 × len()`
    pub fn n_rows(&self) -> usize {
        2 * self.len()
    }

    /// Token id at slot `p` of row `r`
    pub fn token(&self, r: usize, p: usize) -> usize {
        self.tokens[(r * self.n_ctx + p) * 2]
    }

    /// Position id at slot `p` of row `r`
    pub fn position(&self, r: usize, p: usize) -> usize {
        self.tokens[(r * self.n_ctx + p) * 2 + 1]
    }

    /// All token ids of row `r`, padding included
    pub fn row_token_ids(&self, r: usize) -> Vec<usize> {
        (0..self.n_ctx).map(|p| self.token(r, p)).collect()
    }

    pub fn row_mask(&self, r: usize) -> &[f32] {
        &self.mask[r * self.n_ctx..(r + 1) * self.n_ctx]
    }

    /// Examples `range` as a new batch
    pub fn slice(&self, range: Range<usize>) -> EncodedBatch {
        let tok_width = 2 * self.n_ctx * 2;
        let mask_width = 2 * self.n_ctx;
        EncodedBatch {
            tokens: self.tokens[range.start * tok_width..range.end * tok_width].to_vec(),
            mask: self.mask[range.start * mask_width..range.end * mask_width].to_vec(),
            n_ctx: self.n_ctx,
        }
    }

    /// Split into `k` contiguous, equal-sized shards
    ///
    /// Fails when the examples cannot be divided evenly.
    pub fn shards(&self, k: usize) -> Result<Vec<EncodedBatch>, ConfigError> {
        if k == 0 || self.len() % k != 0 {
            return Err(ConfigError::IndivisibleBatch {
                batch: self.len(),
                n_device: k,
            });
        }
        let size = self.len() / k;
        Ok((0..k).map(|i| self.slice(i * size..(i + 1) * size)).collect())
    }

    /// Gather examples by index into a new batch
    pub fn select(&self, indices: &[usize]) -> EncodedBatch {
        let parts: Vec<EncodedBatch> = indices.iter().map(|&i| self.slice(i..i + 1)).collect();
        EncodedBatch::concat(&parts, self.n_ctx)
    }

    /// Stack batches along the example axis
    pub fn concat(parts: &[EncodedBatch], n_ctx: usize) -> EncodedBatch {
        let mut tokens = Vec::with_capacity(parts.iter().map(|p| p.tokens.len()).sum());
        let mut mask = Vec::with_capacity(parts.iter().map(|p| p.mask.len()).sum());
        for part in parts {
            assert_eq!(part.n_ctx, n_ctx, "Cannot concatenate batches with different n_ctx");
            tokens.extend_from_slice(&part.tokens);
            mask.extend_from_slice(&part.mask);
        }
        EncodedBatch { tokens, mask, n_ctx }
    }

    /// Number of packed (unmasked) slots in each row
    pub fn packed_lengths(&self) -> Vec<usize> {
        self.mask
            .chunks(self.n_ctx)
            .map(|row| row.iter().filter(|&&m| m > 0.0).count())
            .collect()
    }
}

/// Packs token-id triples into an [`EncodedBatch`]
#[derive(Clone, Debug)]
pub struct BatchEncoder {
    n_vocab: usize,
    n_ctx: usize,
    max_half: usize,
}

impl BatchEncoder {
    /// Create an encoder for a vocabulary of `n_vocab` ids and rows of `n_ctx` slots
    ///
    /// Fails with [`ConfigError::ContextTooSmall`] when `n_ctx < 3`.
    pub fn new(n_vocab: usize, n_ctx: usize) -> Result<Self, ConfigError> {
        if n_ctx < N_SPECIAL {
            return Err(ConfigError::ContextTooSmall { n_ctx });
        }
        Ok(Self {
            n_vocab,
            n_ctx,
            max_half: (n_ctx / 2).saturating_sub(2),
        })
    }

    /// Encoder for `config`, honoring a pinned `max_len`
    pub fn from_config(config: &ModelConfig) -> Result<Self, ConfigError> {
        let mut encoder = Self::new(config.n_vocab, config.n_ctx)?;
        encoder.max_half = config.truncation_len();
        Ok(encoder)
    }

    /// Longest context or candidate kept before truncation
    pub fn max_half(&self) -> usize {
        self.max_half
    }

    fn start(&self) -> usize {
        self.n_vocab
    }

    fn delimiter(&self) -> usize {
        self.n_vocab + 1
    }

    fn classify(&self) -> usize {
        self.n_vocab + 2
    }

    /// Packed row for one (context, candidate) branch, without padding
    pub fn pack(&self, context: &[usize], candidate: &[usize]) -> Vec<usize> {
        let context = &context[..context.len().min(self.max_half)];
        let candidate = &candidate[..candidate.len().min(self.max_half)];

        let mut row = Vec::with_capacity(context.len() + candidate.len() + N_SPECIAL);
        row.push(self.start());
        row.extend_from_slice(context);
        row.push(self.delimiter());
        row.extend_from_slice(candidate);
        row.push(self.classify());
        row
    }

    /// Encode parallel lists of contexts and candidates
    ///
    /// # Panics
    ///
    /// Panics if the three lists differ in length.
    pub fn encode(
        &self,
        contexts: &[Vec<usize>],
        cands_a: &[Vec<usize>],
        cands_b: &[Vec<usize>],
    ) -> EncodedBatch {
        assert!(
            contexts.len() == cands_a.len() && contexts.len() == cands_b.len(),
            "Context and candidate lists must have equal length"
        );

        let n = contexts.len();
        let mut tokens = vec![0usize; n * 2 * self.n_ctx * 2];
        let mut mask = vec![0.0f32; n * 2 * self.n_ctx];
        let position_base = self.n_vocab + N_SPECIAL;

        for (i, context) in contexts.iter().enumerate() {
            for (j, candidate) in [&cands_a[i], &cands_b[i]].into_iter().enumerate() {
                let r = i * 2 + j;
                let row = self.pack(context, candidate);
                for p in 0..self.n_ctx {
                    let slot = (r * self.n_ctx + p) * 2;
                    tokens[slot + 1] = position_base + p;
                    if let Some(&tok) = row.get(p) {
                        tokens[slot] = tok;
                        mask[r * self.n_ctx + p] = 1.0;
                    }
                }
            }
        }

        EncodedBatch {
            tokens,
            mask,
            n_ctx: self.n_ctx,
        }
    }

    /// Encode examples, returning the batch and its labels
    pub fn encode_examples(&self, examples: &[QaExample]) -> (EncodedBatch, Vec<usize>) {
        let contexts: Vec<Vec<usize>> = examples.iter().map(|e| e.context.clone()).collect();
        let cands_a: Vec<Vec<usize>> = examples.iter().map(|e| e.candidates[0].clone()).collect();
        let cands_b: Vec<Vec<usize>> = examples.iter().map(|e| e.candidates[1].clone()).collect();
        let labels = examples.iter().map(|e| e.label).collect();
        (self.encode(&contexts, &cands_a, &cands_b), labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packs_both_branches() {
        // vocabulary of 10: start=10, delimiter=11, classify=12
        let encoder = BatchEncoder::new(10, 8).unwrap();
        let batch = encoder.encode(&[vec![5, 6]], &[vec![7]], &[vec![8]]);

        assert_eq!(batch.len(), 1);
        assert_eq!(batch.row_token_ids(0), vec![10, 5, 6, 11, 7, 12, 0, 0]);
        assert_eq!(batch.row_token_ids(1), vec![10, 5, 6, 11, 8, 12, 0, 0]);
        assert_eq!(batch.row_mask(0), &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
        assert_eq!(batch.row_mask(1), batch.row_mask(0));
        let positions: Vec<usize> = (0..8).map(|p| batch.position(1, p)).collect();
        assert_eq!(positions, (13..21).collect::<Vec<_>>());
    }

    #[test]
    fn test_context_too_small() {
        assert_eq!(
            BatchEncoder::new(10, 2).unwrap_err(),
            ConfigError::ContextTooSmall { n_ctx: 2 }
        );
        let encoder = BatchEncoder::new(10, 3).unwrap();
        assert_eq!(encoder.pack(&[1, 2], &[3]), vec![10, 11, 12]);
    }

    #[test]
    fn test_truncation_roundtrip() {
        let encoder = BatchEncoder::new(100, 12).unwrap();
        assert_eq!(encoder.max_half(), 4);

        let context: Vec<usize> = (1..=9).collect();
        let candidate: Vec<usize> = (20..23).collect();
        let batch = encoder.encode(&[context.clone()], &[candidate.clone()], &[vec![]]);

        let specials = [100, 101, 102];
        let recovered: Vec<usize> = batch
            .row_token_ids(0)
            .into_iter()
            .zip(batch.row_mask(0))
            .filter(|(tok, &m)| m > 0.0 && !specials.contains(tok))
            .map(|(tok, _)| tok)
            .collect();
        let expected: Vec<usize> = context[..4].iter().chain(&candidate).copied().collect();
        assert_eq!(recovered, expected);
    }

    #[test]
    fn test_fitted_context_keeps_truncation() {
        let mut config = ModelConfig::tiny(100);
        config.n_ctx = 12;
        config.fit_context([(9, 3), (1, 2)]);
        assert_eq!(config.n_ctx, 4 + 3 + 3);

        let encoder = BatchEncoder::from_config(&config).unwrap();
        assert_eq!(encoder.max_half(), 4);
        let batch = encoder.encode(&[(1..=9).collect()], &[vec![20, 21]], &[vec![30, 31, 32]]);
        assert_eq!(
            batch.row_token_ids(1),
            vec![100, 1, 2, 3, 4, 101, 30, 31, 32, 102]
        );
        assert_eq!(batch.packed_lengths(), vec![9, 10]);
    }

    #[test]
    fn test_mask_is_prefix_with_packed_length() {
        let encoder = BatchEncoder::new(50, 16).unwrap();
        let contexts = vec![vec![1; 3], vec![2; 10], vec![]];
        let cands_a = vec![vec![3; 1], vec![4; 20], vec![5; 2]];
        let cands_b = vec![vec![], vec![6; 6], vec![7; 7]];
        let batch = encoder.encode(&contexts, &cands_a, &cands_b);

        for r in 0..batch.n_rows() {
            let mask = batch.row_mask(r);
            assert!(mask.windows(2).all(|w| w[0] >= w[1]));
            let i = r / 2;
            let cand = if r % 2 == 0 { &cands_a[i] } else { &cands_b[i] };
            let expected =
                3 + contexts[i].len().min(encoder.max_half()) + cand.len().min(encoder.max_half());
            assert_eq!(mask.iter().sum::<f32>() as usize, expected);
        }
        assert_eq!(batch.packed_lengths()[2], 3 + 6 + 6);
    }

    #[test]
    fn test_shards_and_select() {
        let encoder = BatchEncoder::new(10, 6).unwrap();
        let contexts: Vec<Vec<usize>> = (0..4).map(|i| vec![i]).collect();
        let batch = encoder.encode(&contexts, &contexts, &contexts);

        let shards = batch.shards(2).unwrap();
        assert_eq!(shards.len(), 2);
        assert_eq!(shards[1].token(0, 1), 2);
        assert_eq!(EncodedBatch::concat(&shards, 6), batch);
        assert!(matches!(
            batch.shards(3),
            Err(ConfigError::IndivisibleBatch { batch: 4, n_device: 3 })
        ));

        let picked = batch.select(&[3, 0]);
        assert_eq!(picked.token(0, 1), 3);
        assert_eq!(picked.token(2, 1), 0);
    }
}
