//! Closed-form OV and QK circuits of a single head.
//!
//! Both are the exact composition of the linear maps the head applies, with
//! softmax and the residual stream left out. The multiplication order of each
//! chain is fixed in a named function and pinned by tests against the
//! reference forward pass in [`crate::forward`].

use qkov_core_tensor::Tensor;

use crate::baseline::Baseline;
use crate::error::{CircuitError, Result};
use crate::slicer::HeadWeights;

/// The single token of a one-token source sequence.
pub fn single_token(tokens: &[u32]) -> Result<u32> {
    match tokens {
        [t] => Ok(*t),
        [] => Err(CircuitError::InvalidInput(
            "source must be a single token, got an empty sequence".into(),
        )),
        _ => Err(CircuitError::InvalidInput(format!(
            "source must be a single token, got {} tokens",
            tokens.len()
        ))),
    }
}

fn check_token(token: u32, vocab: usize) -> Result<usize> {
    if token as usize >= vocab {
        return Err(CircuitError::TokenOutOfRange { token, vocab });
    }
    Ok(token as usize)
}

/// `W_u · (W_o · (W_v · W_e[:, token]))`
///
/// Value projection first, then output projection: the head reads `d_head`
/// values and writes them back to the `d_model` residual.
pub fn ov_chain(
    w_u: &Tensor,
    w_o: &Tensor,
    w_v: &Tensor,
    w_e: &Tensor,
    token: usize,
) -> Result<Vec<f64>> {
    let x = w_e.column(token)?;
    let v = w_v.matvec(&x)?;
    let o = w_o.matvec(&v)?;
    Ok(w_u.matvec(&o)?)
}

/// `W_eᵀ · (W_qᵀ · (W_k · W_e[:, token]))`
///
/// `token` is the key (source) position; entry `s` of the result is the
/// pre-softmax score query token `s` assigns to it.
pub fn qk_chain(w_e: &Tensor, w_q: &Tensor, w_k: &Tensor, token: usize) -> Result<Vec<f64>> {
    let x = w_e.column(token)?;
    let k = w_k.matvec(&x)?;
    let kq = w_q.matvec_t(&k)?;
    Ok(w_e.matvec_t(&kq)?)
}

/// OV circuit: logit effect of `tokens` (exactly one token) over the vocabulary.
pub fn ov(head: &HeadWeights, tokens: &[u32]) -> Result<Vec<f64>> {
    let token = check_token(single_token(tokens)?, head.vocab_size())?;
    let e = &head.embedding;
    ov_chain(&e.w_u, &head.proj.w_o, &head.proj.w_v, &e.w_e, token)
}

/// QK destination scores for one key token, before any baseline correction.
pub fn qk_raw(head: &HeadWeights, token: u32) -> Result<Vec<f64>> {
    let token = check_token(token, head.vocab_size())?;
    qk_chain(&head.embedding.w_e, &head.proj.w_q, &head.proj.w_k, token)
}

/// QK circuit with the baseline subtracted.
///
/// `StartToken` output has `V - 1` entries (the sentinel, always the last
/// vocabulary slot, is dropped); `VocabularyAverage` output has `V`.
pub fn qk(head: &HeadWeights, tokens: &[u32], baseline: &Baseline) -> Result<Vec<f64>> {
    let token = single_token(tokens)?;
    let vocab = head.vocab_size();
    if baseline.len() != vocab {
        return Err(CircuitError::ShapeMismatch(format!(
            "{} baseline has {} entries, vocabulary has {}",
            baseline.mode(),
            baseline.len(),
            vocab
        )));
    }

    let raw = qk_raw(head, token)?;
    let corrected: Vec<f64> = match baseline {
        Baseline::StartToken(start) => {
            let mut d: Vec<f64> = raw.iter().zip(start).map(|(r, s)| r - s).collect();
            d.truncate(vocab - 1);
            debug_assert_eq!(d.len(), vocab - 1);
            d
        }
        Baseline::VocabularyAverage(avg) => {
            let d: Vec<f64> = raw.iter().zip(avg).map(|(r, a)| r - a).collect();
            debug_assert_eq!(d.len(), vocab);
            d
        }
    };

    Ok(corrected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{compute_average_baseline, compute_start_baseline};
    use crate::cancel::Cancellation;
    use crate::session::AnalysisSession;
    use crate::testutil::{assert_all_close, model_config, random_store};

    fn session() -> AnalysisSession {
        let config = model_config(2, 4);
        AnalysisSession::new(&random_store(&config, 9, 5), config).unwrap()
    }

    #[test]
    fn test_single_token_precondition() {
        assert_eq!(single_token(&[4]).unwrap(), 4);
        assert!(matches!(single_token(&[]), Err(CircuitError::InvalidInput(_))));
        assert!(matches!(single_token(&[1, 2]), Err(CircuitError::InvalidInput(_))));
    }

    #[test]
    fn test_ov_and_qk_reject_sequences() {
        let s = session();
        let h = s.head(0).unwrap();
        let base = compute_start_baseline(h).unwrap();
        for bad in [&[][..], &[1, 2][..], &[0, 1, 2][..]] {
            assert!(matches!(ov(h, bad), Err(CircuitError::InvalidInput(_))));
            assert!(matches!(qk(h, bad, &base), Err(CircuitError::InvalidInput(_))));
        }
        assert!(matches!(ov(h, &[9]), Err(CircuitError::TokenOutOfRange { .. })));
    }

    #[test]
    fn test_repeat_calls_are_bit_identical() {
        let s = session();
        let h = s.head(1).unwrap();
        let base = compute_start_baseline(h).unwrap();
        assert_eq!(ov(h, &[3]).unwrap(), ov(h, &[3]).unwrap());
        assert_eq!(qk(h, &[3], &base).unwrap(), qk(h, &[3], &base).unwrap());
    }

    #[test]
    fn test_output_lengths_per_baseline() {
        let s = session();
        let h = s.head(0).unwrap();
        let start = compute_start_baseline(h).unwrap();
        let avg = compute_average_baseline(h, &Cancellation::new()).unwrap();
        assert_eq!(ov(h, &[2]).unwrap().len(), 9);
        assert_eq!(qk(h, &[2], &start).unwrap().len(), 8);
        assert_eq!(qk(h, &[2], &avg).unwrap().len(), 9);
    }

    #[test]
    fn test_start_baseline_subtracts_sentinel_scores() {
        let s = session();
        let h = s.head(0).unwrap();
        let start = compute_start_baseline(h).unwrap();
        let raw = qk_raw(h, 4).unwrap();
        let sentinel = qk_raw(h, 8).unwrap();
        let want: Vec<f64> = raw[..8].iter().zip(&sentinel).map(|(a, b)| a - b).collect();
        assert_all_close(&qk(h, &[4], &start).unwrap(), &want, 1e-15);

        // the sentinel against itself is all zeros
        assert!(qk(h, &[8], &start).unwrap().iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_baseline_length_checked() {
        let s = session();
        let h = s.head(0).unwrap();
        let short = Baseline::VocabularyAverage(vec![0.0; 3]);
        assert!(matches!(qk(h, &[0], &short), Err(CircuitError::ShapeMismatch(_))));
    }

    #[test]
    fn test_ov_chain_order_is_not_interchangeable() {
        // swapping value and output projections only type-checks when
        // d_head == d_model; with d_head < d_model it must be rejected
        let s = session();
        let h = s.head(0).unwrap();
        let e = &h.embedding;
        assert!(ov_chain(&e.w_u, &h.proj.w_v, &h.proj.w_o, &e.w_e, 0).is_err());
    }
}
