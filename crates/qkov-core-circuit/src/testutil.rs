use qkov_core_tensor::{Tensor, WeightStore};

use crate::config::AnalysisConfig;

/// Small deterministic generator so fixtures need no extra crates.
pub(crate) struct Lcg(u64);

impl Lcg {
    pub(crate) fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407))
    }

    /// Uniform in [-1, 1).
    pub(crate) fn next_f64(&mut self) -> f64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((self.0 >> 11) as f64 / (1u64 << 53) as f64) * 2.0 - 1.0
    }

    pub(crate) fn vec(&mut self, n: usize) -> Vec<f64> {
        (0..n).map(|_| self.next_f64()).collect()
    }
}

pub(crate) fn model_config(n_head: usize, d_model: usize) -> AnalysisConfig {
    AnalysisConfig::new(n_head, d_model)
}

/// Every tensor the default keys name, filled with seeded noise.
pub(crate) fn random_store(config: &AnalysisConfig, vocab: usize, seed: u64) -> WeightStore {
    let d = config.d_model;
    let k = &config.keys;
    let mut rng = Lcg::new(seed);
    let mut store = WeightStore::new();

    let mut put = |name: &str, shape: &[usize], data: Vec<f64>| {
        store.insert(Tensor::new(name, shape, data).unwrap());
    };
    put(&k.embedding, &[vocab, d], rng.vec(vocab * d));
    put(&k.in_proj, &[3 * d, d], rng.vec(3 * d * d));
    put(&k.out_proj, &[d, d], rng.vec(d * d));
    put(&k.unembedding, &[vocab, d], rng.vec(vocab * d));
    let scale: Vec<f64> = rng.vec(d).iter().map(|x| 1.0 + 0.5 * x).collect();
    put(&k.attn_norm_scale, &[d], scale);
    put(&k.attn_norm_bias, &[d], rng.vec(d));
    let scale: Vec<f64> = rng.vec(d).iter().map(|x| 1.0 + 0.5 * x).collect();
    put(&k.final_norm_scale, &[d], scale);
    put(&k.final_norm_bias, &[d], rng.vec(d));
    store
}

pub(crate) fn assert_all_close(got: &[f64], want: &[f64], tol: f64) {
    assert_eq!(got.len(), want.len(), "length mismatch");
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!(
            (g - w).abs() <= tol * (1.0 + w.abs()),
            "Mismatch at index {}: got {}, expected {}",
            i,
            g,
            w
        );
    }
}
