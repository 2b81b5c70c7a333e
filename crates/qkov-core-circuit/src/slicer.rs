use log::debug;
use qkov_core_kernel::cpu_norm::scale_cols_f64;
use qkov_core_tensor::Tensor;
use std::ops::Range;
use std::sync::Arc;

use crate::embedding::Embedding;
use crate::error::{CircuitError, Result};
use crate::weights::{ModelWeights, NormParams};

/// Per-head bias left over after folding a norm's shift into Q/K/V.
#[derive(Debug, Clone, PartialEq)]
pub struct FoldedBias {
    pub q: Vec<f64>,
    pub k: Vec<f64>,
    pub v: Vec<f64>,
}

/// The four projections of one head, cut out of the packed tensors.
#[derive(Debug, Clone, PartialEq)]
pub struct HeadProjections {
    /// `[d_head, d_model]`
    pub w_q: Tensor,
    /// `[d_head, d_model]`
    pub w_k: Tensor,
    /// `[d_head, d_model]`
    pub w_v: Tensor,
    /// `[d_model, d_head]`
    pub w_o: Tensor,
    pub folded_bias: Option<FoldedBias>,
}

/// Everything one head's circuits need. Immutable once built.
#[derive(Debug, Clone)]
pub struct HeadWeights {
    pub head: usize,
    pub proj: HeadProjections,
    pub embedding: Arc<Embedding>,
}

impl HeadWeights {
    pub fn new(head: usize, proj: HeadProjections, embedding: Arc<Embedding>) -> Result<Self> {
        let d_model = embedding.d_model();
        let (_, q_cols) = proj.w_q.dims2()?;
        let (o_rows, _) = proj.w_o.dims2()?;
        if q_cols != d_model || o_rows != d_model {
            return Err(CircuitError::ShapeMismatch(format!(
                "head {} projections are for d_model={}, embedding has {}",
                head, q_cols, d_model
            )));
        }
        Ok(Self {
            head,
            proj,
            embedding,
        })
    }

    #[inline]
    pub fn d_head(&self) -> usize {
        self.proj.w_q.shape()[0]
    }

    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.embedding.vocab_size()
    }
}

fn head_range(head: usize, d_head: usize) -> Range<usize> {
    head * d_head..(head + 1) * d_head
}

/// Cut head `head` out of the packed in/out projections.
///
/// The in-projection is `[3 * d_model, d_model]` with the query, key and value
/// blocks stacked in that order; the head owns rows
/// `[head * d_head, (head + 1) * d_head)` of each block and the same range of
/// columns of the out-projection.
pub fn slice(
    weights: &ModelWeights,
    head: usize,
    n_heads: usize,
    d_model: usize,
) -> Result<HeadProjections> {
    if n_heads == 0 || d_model % n_heads != 0 {
        return Err(CircuitError::ShapeMismatch(format!(
            "d_model={} is not divisible by n_heads={}",
            d_model, n_heads
        )));
    }
    if head >= n_heads {
        return Err(CircuitError::InvalidInput(format!(
            "head {} out of range for {} heads",
            head, n_heads
        )));
    }
    if weights.in_proj.shape() != [3 * d_model, d_model] {
        return Err(CircuitError::ShapeMismatch(format!(
            "in-projection has shape {:?}, expected [{}, {}]",
            weights.in_proj.shape(),
            3 * d_model,
            d_model
        )));
    }
    if weights.out_proj.shape() != [d_model, d_model] {
        return Err(CircuitError::ShapeMismatch(format!(
            "out-projection has shape {:?}, expected [{}, {}]",
            weights.out_proj.shape(),
            d_model,
            d_model
        )));
    }

    let d_head = d_model / n_heads;
    let rows = head_range(head, d_head);
    let block = |offset: usize, name: &str| -> Result<Tensor> {
        let r = offset + rows.start..offset + rows.end;
        Ok(weights.in_proj.slice_rows(r)?.with_name(format!("{name}[{head}]")))
    };

    let proj = HeadProjections {
        w_q: block(0, "W_q")?,
        w_k: block(d_model, "W_k")?,
        w_v: block(2 * d_model, "W_v")?,
        w_o: weights
            .out_proj
            .slice_cols(rows.clone())?
            .with_name(format!("W_o[{head}]")),
        folded_bias: None,
    };
    debug!("sliced head {} rows {:?} (d_head={})", head, rows, d_head);
    Ok(proj)
}

/// Fold a norm applied to the head's input into its Q/K/V projections:
/// `W·(γ ⊙ x + β) = (W·diag(γ))·x + W·β`.
pub fn fold_norm(proj: HeadProjections, norm: &NormParams) -> Result<HeadProjections> {
    if proj.folded_bias.is_some() {
        return Err(CircuitError::InvalidInput("norm already folded into this head".into()));
    }
    let fold = |w: &Tensor| -> Result<(Tensor, Vec<f64>)> {
        let (rows, cols) = w.dims2()?;
        let bias = w.matvec(&norm.bias)?;
        let scaled = w.map_data(|data| scale_cols_f64(data, &norm.scale, rows, cols))?;
        Ok((scaled, bias))
    };

    let (w_q, q) = fold(&proj.w_q)?;
    let (w_k, k) = fold(&proj.w_k)?;
    let (w_v, v) = fold(&proj.w_v)?;
    Ok(HeadProjections {
        w_q,
        w_k,
        w_v,
        w_o: proj.w_o,
        folded_bias: Some(FoldedBias { q, k, v }),
    })
}
