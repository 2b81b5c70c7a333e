//! Reference vectors subtracted from raw QK scores.

use log::{debug, info};
use qkov_core_tensor::view::{DType, TensorView, encode_f64_le};
use std::borrow::Cow;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::cancel::Cancellation;
use crate::composer::qk_raw;
use crate::config::{AverageStrategy, BaselineMode};
use crate::error::{CircuitError, Result};
use crate::slicer::HeadWeights;

/// A baseline over the whole vocabulary, tagged with its convention.
#[derive(Debug, Clone, PartialEq)]
pub enum Baseline {
    /// Raw QK scores of the sentinel start token (the last vocabulary slot).
    StartToken(Vec<f64>),
    /// Per query token, the mean of its QK scores over every key.
    VocabularyAverage(Vec<f64>),
}

impl Baseline {
    pub fn mode(&self) -> BaselineMode {
        match self {
            Baseline::StartToken(_) => BaselineMode::StartToken,
            Baseline::VocabularyAverage(_) => BaselineMode::VocabularyAverage,
        }
    }

    pub fn scores(&self) -> &[f64] {
        match self {
            Baseline::StartToken(v) | Baseline::VocabularyAverage(v) => v,
        }
    }

    pub fn len(&self) -> usize {
        self.scores().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores().is_empty()
    }

    fn from_mode(mode: BaselineMode, scores: Vec<f64>) -> Self {
        match mode {
            BaselineMode::StartToken => Baseline::StartToken(scores),
            BaselineMode::VocabularyAverage => Baseline::VocabularyAverage(scores),
        }
    }
}

/// The sentinel start token: the last vocabulary slot.
#[inline]
pub fn start_token_id(vocab: usize) -> u32 {
    vocab.saturating_sub(1) as u32
}

pub fn compute_start_baseline(head: &HeadWeights) -> Result<Baseline> {
    let vocab = head.vocab_size();
    Ok(Baseline::StartToken(qk_raw(head, start_token_id(vocab))?))
}

/// Scan every token as a query and average its score row over all keys.
///
/// This is O(V) chains of O(V·d_model) each; `cancel` is polled between
/// tokens.
pub fn compute_average_baseline(head: &HeadWeights, cancel: &Cancellation) -> Result<Baseline> {
    let e = &head.embedding;
    let vocab = e.vocab_size();
    let mut averages = Vec::with_capacity(vocab);

    for i in 0..vocab {
        cancel.check(i, vocab)?;
        let x = e.token_column(i)?;
        let q = head.proj.w_q.matvec(&x)?;
        let qk = head.proj.w_k.matvec_t(&q)?;
        let row = e.w_e.matvec_t(&qk)?;
        averages.push(row.iter().sum::<f64>() / vocab as f64);

        if (i + 1) % 4096 == 0 {
            debug!("head {}: averaged {}/{} query rows", head.head, i + 1, vocab);
        }
    }

    Ok(Baseline::VocabularyAverage(averages))
}

/// The average baseline in one chain: by linearity the mean score of query
/// `s` over all keys equals its score against the mean key embedding, so
/// `avg = W_eᵀ · (W_qᵀ · (W_k · mean_t W_e[:, t]))`.
pub fn average_baseline_closed_form(head: &HeadWeights) -> Result<Baseline> {
    let e = &head.embedding;
    let mean = e.mean_column()?;
    let k = head.proj.w_k.matvec(&mean)?;
    let kq = head.proj.w_q.matvec_t(&k)?;
    Ok(Baseline::VocabularyAverage(e.w_e.matvec_t(&kq)?))
}

pub fn compute_baseline(
    head: &HeadWeights,
    mode: BaselineMode,
    strategy: AverageStrategy,
    cancel: &Cancellation,
) -> Result<Baseline> {
    match (mode, strategy) {
        (BaselineMode::StartToken, _) => compute_start_baseline(head),
        (BaselineMode::VocabularyAverage, AverageStrategy::Scan) => {
            compute_average_baseline(head, cancel)
        }
        (BaselineMode::VocabularyAverage, AverageStrategy::ClosedForm) => {
            average_baseline_closed_form(head)
        }
    }
}

/// 64-bit FNV-1a over the bit patterns of everything a baseline depends on.
pub fn fingerprint(head: &HeadWeights) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    let tensors = [&head.proj.w_q, &head.proj.w_k, &head.embedding.w_e];
    for t in tensors {
        for v in t.data() {
            for b in v.to_bits().to_le_bytes() {
                hash ^= b as u64;
                hash = hash.wrapping_mul(PRIME);
            }
        }
    }
    hash
}

/// Write-once on-disk baselines, one file of little-endian `f64` per head.
///
/// File names carry a fingerprint of the head's Q/K weights and embedding, so
/// changed weights or normalization never pick up a stale file.
#[derive(Debug, Clone)]
pub struct BaselineCache {
    dir: PathBuf,
}

impl BaselineCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, head: &HeadWeights, mode: BaselineMode) -> PathBuf {
        self.dir
            .join(format!("{}_head_{}_{:016x}.bin", mode, head.head, fingerprint(head)))
    }

    pub fn load(&self, head: &HeadWeights, mode: BaselineMode) -> Result<Option<Baseline>> {
        let path = self.path_for(head, mode);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let vocab = head.vocab_size();
        let view = TensorView {
            data: &bytes,
            shape: Cow::Owned(vec![vocab as u64]),
            dtype: DType::F64,
        };
        let scores = view.to_f64_vec().map_err(|e| {
            CircuitError::ShapeMismatch(format!("baseline cache {}: {e}", path.display()))
        })?;
        debug!("head {}: loaded {} baseline from {}", head.head, mode, path.display());
        Ok(Some(Baseline::from_mode(mode, scores)))
    }

    /// Store `baseline` unless a file for this head and fingerprint already exists.
    pub fn store(&self, head: &HeadWeights, baseline: &Baseline) -> Result<PathBuf> {
        let path = self.path_for(head, baseline.mode());
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path);
        match file {
            Ok(mut f) => {
                f.write_all(&encode_f64_le(baseline.scores()))?;
                f.sync_all()?;
                info!("head {}: wrote {} baseline to {}", head.head, baseline.mode(), path.display());
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("head {}: baseline cache {} already present", head.head, path.display());
            }
            Err(e) => return Err(e.into()),
        }
        Ok(path)
    }

    /// Load from disk, or compute and store.
    pub fn get_or_compute(
        &self,
        head: &HeadWeights,
        mode: BaselineMode,
        strategy: AverageStrategy,
        cancel: &Cancellation,
    ) -> Result<Baseline> {
        if let Some(b) = self.load(head, mode)? {
            return Ok(b);
        }
        let b = compute_baseline(head, mode, strategy, cancel)?;
        self.store(head, &b)?;
        Ok(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::AnalysisSession;
    use crate::testutil::{assert_all_close, model_config, random_store};

    fn session(seed: u64) -> AnalysisSession {
        let config = model_config(2, 4);
        AnalysisSession::new(&random_store(&config, 11, seed), config).unwrap()
    }

    #[test]
    fn test_start_baseline_is_sentinel_row() {
        let s = session(1);
        let h = s.head(1).unwrap();
        let b = compute_start_baseline(h).unwrap();
        assert_eq!(b.mode(), BaselineMode::StartToken);
        assert_eq!(b.scores(), qk_raw(h, 10).unwrap().as_slice());
    }

    #[test]
    fn test_average_matches_brute_force_and_closed_form() {
        let s = session(2);
        let h = s.head(0).unwrap();
        let vocab = h.vocab_size();

        // brute force: build the full V x V score matrix by keys
        let by_key: Vec<Vec<f64>> = (0..vocab as u32).map(|t| qk_raw(h, t).unwrap()).collect();
        let want: Vec<f64> = (0..vocab)
            .map(|s| by_key.iter().map(|col| col[s]).sum::<f64>() / vocab as f64)
            .collect();

        let scan = compute_average_baseline(h, &Cancellation::new()).unwrap();
        let closed = average_baseline_closed_form(h).unwrap();
        assert_all_close(scan.scores(), &want, 1e-10);
        assert_all_close(closed.scores(), &want, 1e-10);
    }

    #[test]
    fn test_average_scan_honours_cancellation() {
        let s = session(3);
        let cancel = Cancellation::new();
        cancel.cancel();
        assert!(matches!(
            compute_average_baseline(s.head(0).unwrap(), &cancel),
            Err(CircuitError::Cancelled { completed: 0, total: 11 })
        ));
    }

    #[test]
    fn test_cache_roundtrip_and_write_once() {
        let s = session(4);
        let h = s.head(1).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cache = BaselineCache::new(dir.path().join("baselines")).unwrap();

        assert!(cache.load(h, BaselineMode::VocabularyAverage).unwrap().is_none());
        let b = cache
            .get_or_compute(
                h,
                BaselineMode::VocabularyAverage,
                AverageStrategy::ClosedForm,
                &Cancellation::new(),
            )
            .unwrap();
        let loaded = cache.load(h, BaselineMode::VocabularyAverage).unwrap().unwrap();
        assert_eq!(loaded, b);

        // a second store leaves the first file alone
        let other = Baseline::VocabularyAverage(vec![0.0; h.vocab_size()]);
        cache.store(h, &other).unwrap();
        assert_eq!(cache.load(h, BaselineMode::VocabularyAverage).unwrap().unwrap(), b);
    }

    #[test]
    fn test_fingerprint_tracks_weights() {
        let a = session(5);
        let b = session(6);
        assert_eq!(fingerprint(a.head(0).unwrap()), fingerprint(a.head(0).unwrap()));
        assert_ne!(fingerprint(a.head(0).unwrap()), fingerprint(a.head(1).unwrap()));
        assert_ne!(fingerprint(a.head(0).unwrap()), fingerprint(b.head(0).unwrap()));
    }

    #[test]
    fn test_truncated_cache_file_rejected() {
        let s = session(7);
        let h = s.head(0).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cache = BaselineCache::new(dir.path()).unwrap();
        std::fs::write(cache.path_for(h, BaselineMode::StartToken), [0u8; 12]).unwrap();
        assert!(matches!(
            cache.load(h, BaselineMode::StartToken),
            Err(CircuitError::ShapeMismatch(_))
        ));
    }
}
