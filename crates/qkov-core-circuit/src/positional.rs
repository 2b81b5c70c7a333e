//! Position-only attention of a head.
//!
//! The model adds a fixed sinusoidal table to the residual stream before the
//! query and key projections (values read the raw stream), so each head has a
//! token-independent term `(W_q·p_i)·(W_k·p_j)` in its attention logits.

use log::debug;
use qkov_core_tensor::Tensor;

use crate::error::{CircuitError, Result};
use crate::slicer::HeadWeights;

const BASE: f64 = 10000.0;

/// The `[block_size, d_model]` sinusoidal table.
///
/// Column pair `(2k, 2k + 1)` holds `sin(pos·ω_k)` and `cos(pos·ω_k)` with
/// `ω_k = BASE^(-2k / d_model)`.
pub fn sinusoidal_encoding(block_size: usize, d_model: usize) -> Result<Tensor> {
    if block_size == 0 || d_model == 0 {
        return Err(CircuitError::InvalidInput(format!(
            "sinusoidal encoding needs positive sizes, got block_size={} d_model={}",
            block_size, d_model
        )));
    }
    let step = -BASE.ln() / d_model as f64;
    let mut data = Vec::with_capacity(block_size * d_model);
    for pos in 0..block_size {
        for c in 0..d_model {
            let angle = pos as f64 * ((c - c % 2) as f64 * step).exp();
            data.push(if c % 2 == 0 { angle.sin() } else { angle.cos() });
        }
    }
    Ok(Tensor::new("pe", &[block_size, d_model], data)?)
}

/// `[block_size, block_size]` matrix whose entry `[i][j]` is the unscaled
/// score query position `i` gives key position `j` from positions alone.
pub fn positional_attention(head: &HeadWeights, block_size: usize) -> Result<Tensor> {
    let pe = sinusoidal_encoding(block_size, head.embedding.d_model())?;
    let q = pe.matmul(&head.proj.w_q.transpose()?)?;
    let k = pe.matmul(&head.proj.w_k.transpose()?)?;
    let scores = q.matmul(&k.transpose()?)?;
    debug!("head {}: positional attention over {} positions", head.head, block_size);
    Ok(scores.with_name(format!("A_pos[{}]", head.head)))
}
