use log::{debug, info};
use num_complex::Complex64;
use qkov_core_tensor::{Tensor, WeightStore};
use rayon::prelude::*;
use std::sync::Arc;

use crate::baseline::{Baseline, BaselineCache, compute_baseline};
use crate::cancel::Cancellation;
use crate::composer::{ov, qk};
use crate::config::AnalysisConfig;
use crate::embedding::{self, Embedding};
use crate::error::{CircuitError, Result};
use crate::export::TokenRecord;
use crate::positional::positional_attention;
use crate::rank::{Ranked, RankedTokens, top_k};
use crate::slicer::{self, HeadWeights};
use crate::spectrum::spectrum;
use crate::tokenizer::Tokenizer;
use crate::weights::ModelWeights;

/// All heads of one model, ready for circuit queries.
///
/// Built once from a weight store and a config. Heads and the embedding are
/// immutable afterwards; the only state that changes is the per-head
/// baselines, filled by [`AnalysisSession::compute_baselines`].
#[derive(Debug)]
pub struct AnalysisSession {
    config: AnalysisConfig,
    embedding: Arc<Embedding>,
    heads: Vec<HeadWeights>,
    baselines: Vec<Option<Baseline>>,
}

impl AnalysisSession {
    pub fn new(store: &WeightStore, config: AnalysisConfig) -> Result<Self> {
        let weights = ModelWeights::from_store(store, &config)?;
        let embedding = Arc::new(embedding::build(
            &weights,
            config.d_model,
            config.normalize_embedding,
            config.apply_final_layernorm,
            config.norm_eps,
        )?);

        let fold_norm = if config.fold_norm_into_heads {
            Some(weights.attn_norm.as_ref().ok_or_else(|| CircuitError::MissingWeight {
                key: config.keys.attn_norm_scale.clone(),
                role: "pre-attention norm",
            })?)
        } else {
            None
        };

        let build_head = |h: usize| -> Result<HeadWeights> {
            let mut proj = slicer::slice(&weights, h, config.n_head, config.d_model)?;
            if let Some(norm) = fold_norm {
                proj = slicer::fold_norm(proj, norm)?;
            }
            HeadWeights::new(h, proj, Arc::clone(&embedding))
        };
        let heads = if config.parallel {
            (0..config.n_head).into_par_iter().map(build_head).collect::<Result<Vec<_>>>()?
        } else {
            (0..config.n_head).map(build_head).collect::<Result<Vec<_>>>()?
        };

        info!(
            "session: {} heads, d_model={}, d_head={}, V={}",
            heads.len(),
            config.d_model,
            config.d_head(),
            embedding.vocab_size()
        );

        Ok(Self {
            baselines: vec![None; heads.len()],
            config,
            embedding,
            heads,
        })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    pub fn vocab_size(&self) -> usize {
        self.embedding.vocab_size()
    }

    pub fn heads(&self) -> &[HeadWeights] {
        &self.heads
    }

    pub fn head(&self, h: usize) -> Result<&HeadWeights> {
        self.heads.get(h).ok_or_else(|| {
            CircuitError::InvalidInput(format!("head {} out of range for {} heads", h, self.heads.len()))
        })
    }

    fn all_heads(&self) -> Vec<usize> {
        (0..self.heads.len()).collect()
    }

    fn check_heads(&self, heads: &[usize]) -> Result<()> {
        heads.iter().try_for_each(|&h| self.head(h).map(|_| ()))
    }

    /// Compute (or load from `cache`) the configured baseline for every head.
    pub fn compute_baselines(
        &mut self,
        cache: Option<&BaselineCache>,
        cancel: &Cancellation,
    ) -> Result<()> {
        let all = self.all_heads();
        self.compute_baselines_for(&all, cache, cancel)
    }

    /// Like [`Self::compute_baselines`], restricted to `heads`. Other heads
    /// keep whatever baseline they already had.
    pub fn compute_baselines_for(
        &mut self,
        heads: &[usize],
        cache: Option<&BaselineCache>,
        cancel: &Cancellation,
    ) -> Result<()> {
        self.check_heads(heads)?;
        let mode = self.config.baseline_mode;
        let strategy = self.config.average_strategy;
        let one = |&h: &usize| -> Result<(usize, Baseline)> {
            let head = &self.heads[h];
            let b = match cache {
                Some(c) => c.get_or_compute(head, mode, strategy, cancel)?,
                None => compute_baseline(head, mode, strategy, cancel)?,
            };
            debug!("head {}: {} baseline ready", h, mode);
            Ok((h, b))
        };

        let computed = if self.config.parallel {
            heads.par_iter().map(one).collect::<Result<Vec<_>>>()?
        } else {
            heads.iter().map(one).collect::<Result<Vec<_>>>()?
        };
        for (h, b) in computed {
            self.baselines[h] = Some(b);
        }
        info!("{} baselines ready for {} heads", mode, heads.len());
        Ok(())
    }

    /// Install a precomputed baseline for one head.
    pub fn insert_baseline(&mut self, h: usize, baseline: Baseline) -> Result<()> {
        let vocab = self.head(h)?.vocab_size();
        if baseline.mode() != self.config.baseline_mode {
            return Err(CircuitError::InvalidInput(format!(
                "session uses {} baselines, got {}",
                self.config.baseline_mode,
                baseline.mode()
            )));
        }
        if baseline.len() != vocab {
            return Err(CircuitError::ShapeMismatch(format!(
                "baseline for head {} has {} entries, vocabulary has {}",
                h,
                baseline.len(),
                vocab
            )));
        }
        self.baselines[h] = Some(baseline);
        Ok(())
    }

    pub fn baseline(&self, h: usize) -> Result<&Baseline> {
        self.head(h)?;
        self.baselines[h]
            .as_ref()
            .ok_or(CircuitError::MissingBaseline {
                head: h,
                mode: self.config.baseline_mode,
            })
    }

    /// Top `top_k` tokens whose logits `tokens` pushes up through head `h`.
    pub fn source_to_out(&self, h: usize, tokens: &[u32]) -> Result<Vec<Ranked>> {
        top_k(&ov(self.head(h)?, tokens)?, self.config.top_k)
    }

    /// Top `top_k` query tokens that attend most to `tokens` through head `h`.
    pub fn source_to_dest(&self, h: usize, tokens: &[u32]) -> Result<Vec<Ranked>> {
        let scores = qk(self.head(h)?, tokens, self.baseline(h)?)?;
        top_k(&scores, self.config.top_k)
    }

    /// Both ranked lists for one source token, decoded, with the combined score.
    pub fn token_report(
        &self,
        h: usize,
        tokens: &[u32],
        tokenizer: &dyn Tokenizer,
    ) -> Result<TokenRecord> {
        let out = RankedTokens::decode(&self.source_to_out(h, tokens)?, tokenizer);
        let dest = RankedTokens::decode(&self.source_to_dest(h, tokens)?, tokenizer);
        Ok(TokenRecord::new(tokens[0], out, dest))
    }

    /// OV eigenvalues of every head, in head order.
    pub fn spectra(&self) -> Result<Vec<Vec<Complex64>>> {
        self.spectra_for(&self.all_heads())
    }

    /// OV eigenvalues of `heads`, in the order given.
    pub fn spectra_for(&self, heads: &[usize]) -> Result<Vec<Vec<Complex64>>> {
        self.check_heads(heads)?;
        if self.config.parallel {
            heads.par_iter().map(|&h| spectrum(&self.heads[h])).collect()
        } else {
            heads.iter().map(|&h| spectrum(&self.heads[h])).collect()
        }
    }

    /// Position-by-position attention logits of head `h` over `block_size`
    /// positions.
    pub fn positional_attention(&self, h: usize) -> Result<Tensor> {
        positional_attention(self.head(h)?, self.config.block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AverageStrategy, BaselineMode};
    use crate::testutil::{model_config, random_store};
    use crate::tokenizer::VocabTokenizer;

    fn config() -> AnalysisConfig {
        let mut c = model_config(4, 8);
        c.top_k = 3;
        c
    }

    #[test]
    fn test_parallel_and_serial_sessions_agree() {
        let store = random_store(&config(), 12, 8);
        let par = AnalysisSession::new(&store, config()).unwrap();
        let mut serial_config = config();
        serial_config.parallel = false;
        let serial = AnalysisSession::new(&store, serial_config).unwrap();

        assert_eq!(par.heads().len(), 4);
        for h in 0..4 {
            assert_eq!(par.head(h).unwrap().proj, serial.head(h).unwrap().proj);
            assert_eq!(par.head(h).unwrap().head, h);
        }
        assert_eq!(par.spectra().unwrap(), serial.spectra().unwrap());
    }

    #[test]
    fn test_head_subset_baselines_and_spectra() {
        let mut s = AnalysisSession::new(&random_store(&config(), 12, 13), config()).unwrap();
        s.compute_baselines_for(&[2], None, &Cancellation::new()).unwrap();
        assert!(s.baseline(2).is_ok());
        for h in [0, 1, 3] {
            assert!(matches!(s.baseline(h), Err(CircuitError::MissingBaseline { .. })));
        }
        assert!(matches!(
            s.compute_baselines_for(&[4], None, &Cancellation::new()),
            Err(CircuitError::InvalidInput(_))
        ));

        let all = s.spectra().unwrap();
        let some = s.spectra_for(&[3, 1]).unwrap();
        assert_eq!(some, vec![all[3].clone(), all[1].clone()]);
        assert!(s.spectra_for(&[9]).is_err());
    }

    #[test]
    fn test_positional_attention_uses_block_size() {
        let mut c = config();
        c.block_size = 6;
        let s = AnalysisSession::new(&random_store(&c, 12, 14), c).unwrap();
        let a = s.positional_attention(1).unwrap();
        assert_eq!(a.shape(), &[6, 6]);
        assert_eq!(a.name(), "A_pos[1]");
        assert!(s.positional_attention(4).is_err());
    }

    #[test]
    fn test_dest_needs_baseline() {
        let mut s = AnalysisSession::new(&random_store(&config(), 12, 9), config()).unwrap();
        assert!(matches!(
            s.source_to_dest(2, &[1]),
            Err(CircuitError::MissingBaseline { head: 2, mode: BaselineMode::StartToken })
        ));
        s.compute_baselines(None, &Cancellation::new()).unwrap();
        let ranked = s.source_to_dest(2, &[1]).unwrap();
        assert_eq!(ranked.len(), 3);
        // the sentinel never appears in start-token mode
        assert!(ranked.iter().all(|r| r.token_id < 11));
    }

    #[test]
    fn test_insert_baseline_checks_mode_and_length() {
        let mut s = AnalysisSession::new(&random_store(&config(), 12, 10), config()).unwrap();
        assert!(matches!(
            s.insert_baseline(0, Baseline::VocabularyAverage(vec![0.0; 12])),
            Err(CircuitError::InvalidInput(_))
        ));
        assert!(matches!(
            s.insert_baseline(0, Baseline::StartToken(vec![0.0; 5])),
            Err(CircuitError::ShapeMismatch(_))
        ));
        s.insert_baseline(0, Baseline::StartToken(vec![0.0; 12])).unwrap();
        assert!(s.baseline(0).is_ok());
        assert!(s.baseline(1).is_err());
        assert!(matches!(s.baseline(7), Err(CircuitError::InvalidInput(_))));
    }

    #[test]
    fn test_token_report_combined_score() {
        let mut c = config();
        c.baseline_mode = BaselineMode::VocabularyAverage;
        c.average_strategy = AverageStrategy::ClosedForm;
        let mut s = AnalysisSession::new(&random_store(&c, 12, 11), c).unwrap();
        s.compute_baselines(None, &Cancellation::new()).unwrap();

        let vocab: Vec<String> = (0..12).map(|i| format!("t{i}")).collect();
        let tok = VocabTokenizer::new(vocab);
        let r = s.token_report(1, &[5], &tok).unwrap();
        assert_eq!(r.token_id, 5);
        assert_eq!(r.source_to_out.tokens.len(), 3);
        assert_eq!(
            r.combined_score,
            r.source_to_out.scores[0] * r.source_to_dest.scores[0]
        );
        assert_eq!(r.source_to_out.tokens[0], format!("t{}", r.source_to_out.token_ids[0]));
    }

    #[test]
    fn test_top_k_larger_than_vocabulary() {
        let mut c = config();
        c.top_k = 13;
        let s = AnalysisSession::new(&random_store(&c, 12, 12), c).unwrap();
        assert!(matches!(
            s.source_to_out(0, &[0]),
            Err(CircuitError::TopKOutOfRange { k: 13, len: 12 })
        ));
    }
}
