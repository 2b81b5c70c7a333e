use crate::cpu_softmax::softmax_inplace_f64;

pub fn attention_scores_f64(
    q: &[f64],       // shape: [d_k]
    k: &[f64],       // shape: [n_tokens * d_k]
    out: &mut [f64], // shape: [n_tokens]
    d_k: usize,
    n_tokens: usize,
) -> anyhow::Result<()> {
    if q.len() != d_k || k.len() != n_tokens * d_k || out.len() != n_tokens {
        anyhow::bail!("attention_scores: length mismatch");
    }

    for (t, o) in out.iter_mut().enumerate() {
        let row = &k[t * d_k..(t + 1) * d_k];
        *o = q.iter().zip(row).map(|(a, b)| a * b).sum();
    }
    Ok(())
}

pub fn scale_scores(scores: &mut [f64], factor: f64) {
    for s in scores.iter_mut() {
        *s *= factor;
    }
}

pub fn attention_weighted_sum_f64(
    weights: &[f64], // shape: [n_tokens]
    v: &[f64],       // shape: [n_tokens * d_v]
    out: &mut [f64], // shape: [d_v]
    n_tokens: usize,
    d_v: usize,
) -> anyhow::Result<()> {
    if weights.len() != n_tokens || v.len() != n_tokens * d_v || out.len() != d_v {
        anyhow::bail!("attention_weighted_sum: length mismatch");
    }

    for (j, o) in out.iter_mut().enumerate() {
        let mut sum = 0.0;
        for t in 0..n_tokens {
            sum += weights[t] * v[t * d_v + j];
        }
        *o = sum;
    }
    Ok(())
}

/// Single-query attention: q ⋅ kᵀ → scale → softmax → weighted sum of v.
/// Returns the softmax weights alongside the output.
pub fn attention_forward(
    q: &[f64],       // shape: [d_k]
    k: &[f64],       // shape: [n_tokens * d_k]
    v: &[f64],       // shape: [n_tokens * d_v]
    out: &mut [f64], // shape: [d_v]
    d_k: usize,
    d_v: usize,
    n_tokens: usize,
) -> anyhow::Result<Vec<f64>> {
    let mut scores = vec![0.0f64; n_tokens];
    attention_scores_f64(q, k, &mut scores, d_k, n_tokens)?;

    scale_scores(&mut scores, 1.0 / (d_k as f64).sqrt());
    softmax_inplace_f64(&mut scores)?;

    attention_weighted_sum_f64(&scores, v, out, n_tokens, d_v)?;

    Ok(scores)
}
