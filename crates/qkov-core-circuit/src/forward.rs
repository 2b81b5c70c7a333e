//! Reference forward pass of one head over a short context.
//!
//! Kept deliberately plain: one token at a time through the kernels, no
//! chain reordering. The closed-form circuits in [`crate::composer`] are
//! tested against it.

use log::trace;
use qkov_core_kernel::cpu_attention::{attention_forward, attention_scores_f64};
use qkov_core_kernel::cpu_inspect::{entropy, l2_norm};

use crate::error::{CircuitError, Result};
use crate::slicer::HeadWeights;

/// Output of [`head_logits`].
#[derive(Debug, Clone, PartialEq)]
pub struct HeadForward {
    /// Logit contribution of the head at the last context position, `[V]`.
    pub logits: Vec<f64>,
    /// Softmax weights the last position puts on each context position.
    pub attention: Vec<f64>,
}

struct Projected {
    q: Vec<f64>,
    k: Vec<f64>,
    v: Vec<f64>,
}

fn add_bias(x: &mut [f64], bias: Option<&[f64]>) {
    if let Some(b) = bias {
        x.iter_mut().zip(b).for_each(|(x, b)| *x += b);
    }
}

fn project(head: &HeadWeights, token: u32) -> Result<Projected> {
    let x = head.embedding.token_column(token as usize)?;
    let bias = head.proj.folded_bias.as_ref();

    let mut q = head.proj.w_q.matvec(&x)?;
    let mut k = head.proj.w_k.matvec(&x)?;
    let mut v = head.proj.w_v.matvec(&x)?;
    add_bias(&mut q, bias.map(|b| b.q.as_slice()));
    add_bias(&mut k, bias.map(|b| b.k.as_slice()));
    add_bias(&mut v, bias.map(|b| b.v.as_slice()));
    Ok(Projected { q, k, v })
}

fn non_empty(context: &[u32]) -> Result<()> {
    if context.is_empty() {
        return Err(CircuitError::InvalidInput("empty context".into()));
    }
    Ok(())
}

/// Unscaled `q_query · k_t` for every key token, before softmax.
pub fn attention_scores(head: &HeadWeights, query: u32, keys: &[u32]) -> Result<Vec<f64>> {
    non_empty(keys)?;
    let d_head = head.d_head();
    let q = project(head, query)?.q;
    let mut k = Vec::with_capacity(keys.len() * d_head);
    for &t in keys {
        k.extend(project(head, t)?.k);
    }
    let mut scores = vec![0.0; keys.len()];
    attention_scores_f64(&q, &k, &mut scores, d_head, keys.len())?;
    Ok(scores)
}

/// The head's logit contribution at the last position of `context`.
///
/// The last token is the query and attends to every position (itself
/// included) with `1/sqrt(d_head)` scaled softmax; the mixed value vector is
/// written back with `W_o` and unembedded with `W_u`.
pub fn head_logits(head: &HeadWeights, context: &[u32]) -> Result<HeadForward> {
    non_empty(context)?;
    let d_head = head.d_head();
    let n = context.len();

    let projected = context
        .iter()
        .map(|&t| project(head, t))
        .collect::<Result<Vec<_>>>()?;
    let k: Vec<f64> = projected.iter().flat_map(|p| p.k.iter().copied()).collect();
    let v: Vec<f64> = projected.iter().flat_map(|p| p.v.iter().copied()).collect();
    let q = &projected[n - 1].q;

    let mut mixed = vec![0.0; d_head];
    let attention = attention_forward(q, &k, &v, &mut mixed, d_head, d_head, n)?;
    trace!(
        "head {}: attention entropy {:.4} over {} positions, value norm {:.4}",
        head.head,
        entropy(&attention),
        n,
        l2_norm(&mixed)
    );

    let resid = head.proj.w_o.matvec(&mixed)?;
    let logits = head.embedding.w_u.matvec(&resid)?;
    Ok(HeadForward { logits, attention })
}
