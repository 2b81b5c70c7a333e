use qkov_core_kernel::cpu_topk::top_k_f64;
use serde::Serialize;

use crate::error::{CircuitError, Result};
use crate::tokenizer::Tokenizer;

/// One ranked vocabulary entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Ranked {
    pub token_id: u32,
    pub score: f64,
}

/// `k` highest scores, descending, exact ties broken by ascending token id.
pub fn top_k(scores: &[f64], k: usize) -> Result<Vec<Ranked>> {
    if k > scores.len() {
        return Err(CircuitError::TopKOutOfRange {
            k,
            len: scores.len(),
        });
    }
    Ok(top_k_f64(scores, k)?
        .into_iter()
        .map(|(i, score)| Ranked {
            token_id: i as u32,
            score,
        })
        .collect())
}

/// A ranked list with decoded token text, in export order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedTokens {
    pub token_ids: Vec<u32>,
    pub tokens: Vec<String>,
    pub scores: Vec<f64>,
}

impl RankedTokens {
    pub fn decode(ranked: &[Ranked], tokenizer: &dyn Tokenizer) -> Self {
        let token_ids: Vec<u32> = ranked.iter().map(|r| r.token_id).collect();
        let tokens = tokenizer
            .decode_tokens_bytes(&token_ids)
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect();
        Self {
            token_ids,
            tokens,
            scores: ranked.iter().map(|r| r.score).collect(),
        }
    }

    /// Score of the first-ranked entry.
    pub fn top_score(&self) -> Option<f64> {
        self.scores.first().copied()
    }
}
