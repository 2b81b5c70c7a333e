use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::{CircuitError, Result};

/// Which reference vector is subtracted from raw QK scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineMode {
    /// Subtract the scores of the sentinel start token (last vocabulary slot)
    /// and drop the sentinel's own entry.
    #[default]
    StartToken,
    /// Subtract each query token's mean score over all keys.
    VocabularyAverage,
}

impl fmt::Display for BaselineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaselineMode::StartToken => write!(f, "start_token"),
            BaselineMode::VocabularyAverage => write!(f, "vocabulary_average"),
        }
    }
}

/// How the vocabulary-average baseline is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AverageStrategy {
    /// One QK chain per vocabulary token, averaged row by row.
    #[default]
    Scan,
    /// The same vector from a single chain on the mean embedding column.
    ClosedForm,
}

/// Names of the entries the analysis reads from the weight store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightKeys {
    pub in_proj: String,
    pub out_proj: String,
    pub embedding: String,
    pub unembedding: String,
    pub attn_norm_scale: String,
    pub attn_norm_bias: String,
    pub final_norm_scale: String,
    pub final_norm_bias: String,
}

impl Default for WeightKeys {
    fn default() -> Self {
        Self {
            in_proj: "attn.attn.in_proj_weight".into(),
            out_proj: "attn.attn.out_proj.weight".into(),
            embedding: "embedding.weight".into(),
            unembedding: "unembedding.weight".into(),
            attn_norm_scale: "ln_attn.weight".into(),
            attn_norm_bias: "ln_attn.bias".into(),
            final_norm_scale: "ln_f.weight".into(),
            final_norm_bias: "ln_f.bias".into(),
        }
    }
}

/// Analysis configuration. Built once and passed by reference to every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub n_head: usize,
    pub d_model: usize,
    /// Standardize the embedding and apply the pre-attention norm to it.
    pub normalize_embedding: bool,
    /// Fold the final norm's scale into the unembedding.
    pub apply_final_layernorm: bool,
    /// Fold the pre-attention norm into each head's Q/K/V instead of the embedding.
    pub fold_norm_into_heads: bool,
    pub baseline_mode: BaselineMode,
    pub average_strategy: AverageStrategy,
    pub top_k: usize,
    /// Added to the variance before standardizing the embedding.
    pub norm_eps: f64,
    /// Map over heads with rayon.
    pub parallel: bool,
    /// Positions covered by the sinusoidal table fed to queries and keys.
    pub block_size: usize,
    pub keys: WeightKeys,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            n_head: 8,
            d_model: 512,
            normalize_embedding: true,
            apply_final_layernorm: true,
            fold_norm_into_heads: false,
            baseline_mode: BaselineMode::default(),
            average_strategy: AverageStrategy::default(),
            top_k: 5,
            norm_eps: 0.0,
            parallel: true,
            block_size: 128,
            keys: WeightKeys::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn new(n_head: usize, d_model: usize) -> Self {
        Self {
            n_head,
            d_model,
            ..Self::default()
        }
    }

    #[inline]
    pub fn d_head(&self) -> usize {
        self.d_model / self.n_head
    }

    pub fn validate(&self) -> Result<()> {
        if self.n_head == 0 {
            return Err(CircuitError::InvalidConfig("n_head must be positive".into()));
        }
        if self.d_model == 0 || self.d_model % self.n_head != 0 {
            return Err(CircuitError::InvalidConfig(format!(
                "d_model={} is not a positive multiple of n_head={}",
                self.d_model, self.n_head
            )));
        }
        if self.top_k == 0 {
            return Err(CircuitError::InvalidConfig("top_k must be positive".into()));
        }
        if self.block_size == 0 {
            return Err(CircuitError::InvalidConfig("block_size must be positive".into()));
        }
        if self.normalize_embedding && self.fold_norm_into_heads {
            return Err(CircuitError::InvalidConfig(
                "normalize_embedding and fold_norm_into_heads both apply the pre-attention norm"
                    .into(),
            ));
        }
        if self.norm_eps.is_nan() || self.norm_eps < 0.0 {
            return Err(CircuitError::InvalidConfig(format!(
                "norm_eps must be non-negative, got {}",
                self.norm_eps
            )));
        }
        Ok(())
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let config: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        Ok(config)
    }
}
