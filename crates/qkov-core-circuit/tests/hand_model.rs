//! End-to-end checks on a 2-head, d_model = 4, 3-token model small enough to
//! work out by hand.

use num_complex::Complex64;
use qkov_core_circuit::baseline::compute_baseline;
use qkov_core_circuit::composer::{ov, qk};
use qkov_core_circuit::forward::head_logits;
use qkov_core_circuit::spectrum::spectrum;
use qkov_core_circuit::{
    AnalysisConfig, AnalysisSession, AverageStrategy, BaselineMode, Cancellation, CircuitError,
    VocabTokenizer,
};
use qkov_core_tensor::{Tensor, WeightStore};

fn rows(r: &[[f64; 4]]) -> Vec<f64> {
    r.iter().flatten().copied().collect()
}

fn config() -> AnalysisConfig {
    let mut c = AnalysisConfig::new(2, 4);
    c.normalize_embedding = false;
    c.apply_final_layernorm = false;
    c.top_k = 2;
    c
}

fn store(c: &AnalysisConfig) -> WeightStore {
    let z = [0.0; 4];
    let in_proj = rows(&[
        // query: head 0, head 1
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        z,
        z,
        // key
        [0.0, 1.0, 0.0, 0.0],
        [1.0, 0.0, 0.0, 0.0],
        z,
        z,
        // value
        [1.0, 2.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 1.0],
        z,
        z,
    ]);
    let out_proj = rows(&[
        [1.0, 0.0, 9.0, 9.0],
        [0.0, 1.0, 9.0, 9.0],
        [1.0, 1.0, 9.0, 9.0],
        [0.0, -1.0, 9.0, 9.0],
    ]);
    let embedding = rows(&[
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 1.0],
    ]);
    let unembedding = rows(&[
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [1.0, 1.0, 1.0, 1.0],
    ]);

    let mut s = WeightStore::new();
    s.insert(Tensor::new(c.keys.in_proj.clone(), &[12, 4], in_proj).unwrap());
    s.insert(Tensor::new(c.keys.out_proj.clone(), &[4, 4], out_proj).unwrap());
    s.insert(Tensor::new(c.keys.embedding.clone(), &[3, 4], embedding).unwrap());
    s.insert(Tensor::new(c.keys.unembedding.clone(), &[3, 4], unembedding).unwrap());
    s
}

fn session(c: AnalysisConfig) -> AnalysisSession {
    AnalysisSession::new(&store(&c), c).unwrap()
}

#[test]
fn test_ov_matches_hand_computation() {
    let s = session(config());
    let h = s.head(0).unwrap();
    assert_eq!(ov(h, &[0]).unwrap(), vec![1.0, 0.0, 2.0]);
    assert_eq!(ov(h, &[2]).unwrap(), vec![0.0, 1.0, 1.0]);

    // head 1 has zero value rows
    assert_eq!(ov(s.head(1).unwrap(), &[0]).unwrap(), vec![0.0; 3]);
}

#[test]
fn test_ov_agrees_with_forward_pass() {
    let s = session(config());
    let h = s.head(0).unwrap();
    for t in 0..3 {
        assert_eq!(head_logits(h, &[t]).unwrap().logits, ov(h, &[t]).unwrap());
    }
}

#[test]
fn test_qk_start_token_baseline() {
    let s = session(config());
    let h = s.head(0).unwrap();
    let base = compute_baseline(
        h,
        BaselineMode::StartToken,
        AverageStrategy::Scan,
        &Cancellation::new(),
    )
    .unwrap();
    // the sentinel (token 2) has a zero key, so the baseline is zero
    assert_eq!(base.scores(), &[0.0, 0.0, 0.0]);
    assert_eq!(qk(h, &[0], &base).unwrap(), vec![0.0, 1.0]);
    assert_eq!(qk(h, &[1], &base).unwrap(), vec![1.0, 0.0]);
}

#[test]
fn test_qk_average_baseline() {
    let s = session(config());
    let h = s.head(0).unwrap();
    for strategy in [AverageStrategy::Scan, AverageStrategy::ClosedForm] {
        let base =
            compute_baseline(h, BaselineMode::VocabularyAverage, strategy, &Cancellation::new())
                .unwrap();
        let got = qk(h, &[0], &base).unwrap();
        let want = [-1.0 / 3.0, 2.0 / 3.0, 0.0];
        assert_eq!(got.len(), 3);
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() < 1e-15, "{:?} vs {:?}", got, want);
        }
    }
}

#[test]
fn test_spectrum_by_hand() {
    // M = [[1, 2], [2, 2]]: trace 3, determinant -2
    let s = session(config());
    let mut ev = spectrum(s.head(0).unwrap()).unwrap();
    ev.sort_by(|a, b| a.re.total_cmp(&b.re));
    let r = 17f64.sqrt();
    assert!((ev[0] - Complex64::new((3.0 - r) / 2.0, 0.0)).norm() < 1e-12);
    assert!((ev[1] - Complex64::new((3.0 + r) / 2.0, 0.0)).norm() < 1e-12);

    // head 1 is all zeros
    for z in spectrum(s.head(1).unwrap()).unwrap() {
        assert!(z.norm() < 1e-15);
    }
}

#[test]
fn test_session_ranked_report() {
    let mut s = session(config());
    s.compute_baselines(None, &Cancellation::new()).unwrap();
    let tok = VocabTokenizer::new(["cat", "dog", "<|start|>"].map(String::from).to_vec());

    let r = s.token_report(0, &[0], &tok).unwrap();
    assert_eq!(r.source_to_out.token_ids, vec![2, 0]);
    assert_eq!(r.source_to_out.tokens, vec!["<|start|>", "cat"]);
    assert_eq!(r.source_to_dest.token_ids, vec![1, 0]);
    assert_eq!(r.combined_score, 2.0 * 1.0);
}

#[test]
fn test_missing_norms_reported_once() {
    let mut c = config();
    c.apply_final_layernorm = true;
    match AnalysisSession::new(&store(&c), c.clone()) {
        Err(CircuitError::MissingWeight { key, .. }) => assert_eq!(key, c.keys.final_norm_scale),
        other => panic!("expected MissingWeight, got {:?}", other.map(|_| ())),
    }
}
