use log::{debug, warn};
use qkov_core_kernel::cpu_norm::{affine_rows_f64, scale_cols_f64, standardize_arr_f64};
use qkov_core_tensor::Tensor;

use crate::error::{CircuitError, Result};
use crate::weights::ModelWeights;

/// Shared embedding and unembedding seen by every head.
#[derive(Debug, Clone)]
pub struct Embedding {
    /// `[d_model, V]`: column `t` is token `t`'s input to the attention layer.
    pub w_e: Tensor,
    /// `[V, d_model]`
    pub w_u: Tensor,
}

impl Embedding {
    pub fn new(w_e: Tensor, w_u: Tensor) -> Result<Self> {
        let (d, vocab) = w_e.dims2()?;
        let (vocab_u, d_u) = w_u.dims2()?;
        if d != d_u || vocab != vocab_u {
            return Err(CircuitError::ShapeMismatch(format!(
                "W_e is {}x{} but W_u is {}x{}",
                d, vocab, vocab_u, d_u
            )));
        }
        Ok(Self { w_e, w_u })
    }

    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.w_e.shape()[1]
    }

    #[inline]
    pub fn d_model(&self) -> usize {
        self.w_e.shape()[0]
    }

    /// `W_e[:, token]`
    pub fn token_column(&self, token: usize) -> Result<Vec<f64>> {
        if token >= self.vocab_size() {
            return Err(CircuitError::TokenOutOfRange {
                token: token as u32,
                vocab: self.vocab_size(),
            });
        }
        Ok(self.w_e.column(token)?)
    }

    /// Mean over all token columns of `W_e`.
    pub fn mean_column(&self) -> Result<Vec<f64>> {
        Ok(self.w_e.row_means()?)
    }
}

/// Build `(W_e, W_u)` from the model weights.
///
/// `normalize` standardizes the whole embedding (one global mean and standard
/// deviation) and then applies the pre-attention norm's scale/bias per model
/// dimension. `apply_final_norm` folds the final norm's scale into the columns
/// of `W_u`. The two are independent.
pub fn build(
    weights: &ModelWeights,
    d_model: usize,
    normalize: bool,
    apply_final_norm: bool,
    eps: f64,
) -> Result<Embedding> {
    let (vocab, emb_dim) = weights.embedding.dims2()?;
    if emb_dim != d_model {
        return Err(CircuitError::Dimension(format!(
            "embedding table has {} features, expected d_model={}",
            emb_dim, d_model
        )));
    }

    let mut w_e = weights.embedding.transpose()?.with_name("W_e");

    if normalize {
        let norm = weights
            .attn_norm
            .as_ref()
            .ok_or_else(|| CircuitError::MissingWeight {
                key: "pre-attention norm".into(),
                role: "embedding normalization",
            })?;
        w_e = w_e.map_data(|data| {
            let input = data.to_vec();
            let (mean, denom) = standardize_arr_f64(&input, data, eps)?;
            debug!("embedding standardized: mean={:.6} std={:.6}", mean, denom);
            if denom < 1e-12 {
                warn!("embedding is nearly constant (std={:e})", denom);
            }
            affine_rows_f64(data, &norm.scale, &norm.bias, d_model, vocab)
        })?;
    }

    let mut w_u = weights.unembedding.clone().with_name("W_u");
    if apply_final_norm {
        let norm = weights
            .final_norm
            .as_ref()
            .ok_or_else(|| CircuitError::MissingWeight {
                key: "final norm".into(),
                role: "unembedding normalization",
            })?;
        w_u = w_u.map_data(|data| scale_cols_f64(data, &norm.scale, vocab, d_model))?;
    }

    Embedding::new(w_e, w_u)
}
