//! Typed view of the weight store.
//!
//! Every key lookup and shape check happens here, once, so the rest of the
//! analysis works with named fields instead of ad hoc string keys.

use log::debug;
use qkov_core_tensor::{Tensor, WeightStore};

use crate::config::AnalysisConfig;
use crate::error::{CircuitError, Result};

/// Scale and shift of one normalization layer, each `[d_model]`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormParams {
    pub scale: Vec<f64>,
    pub bias: Vec<f64>,
}

/// The tensors a one-layer attention-only model contributes to the analysis.
#[derive(Debug, Clone)]
pub struct ModelWeights {
    /// `[3 * d_model, d_model]`, ordered query, key, value.
    pub in_proj: Tensor,
    /// `[d_model, d_model]`
    pub out_proj: Tensor,
    /// `[V, d_model]`
    pub embedding: Tensor,
    /// `[V, d_model]`
    pub unembedding: Tensor,
    pub attn_norm: Option<NormParams>,
    pub final_norm: Option<NormParams>,
}

fn require<'a>(store: &'a WeightStore, key: &str, role: &'static str) -> Result<&'a Tensor> {
    store.get(key).ok_or_else(|| CircuitError::MissingWeight {
        key: key.to_string(),
        role,
    })
}

fn expect_shape(t: &Tensor, shape: &[usize], role: &str) -> Result<()> {
    if t.shape() != shape {
        return Err(CircuitError::ShapeMismatch(format!(
            "{} '{}' has shape {:?}, expected {:?}",
            role,
            t.name(),
            t.shape(),
            shape
        )));
    }
    Ok(())
}

fn load_norm(
    store: &WeightStore,
    scale_key: &str,
    bias_key: &str,
    d_model: usize,
    required: bool,
    role: &'static str,
) -> Result<Option<NormParams>> {
    if !required && !(store.contains(scale_key) && store.contains(bias_key)) {
        return Ok(None);
    }
    Ok(Some(NormParams {
        scale: norm_vector(require(store, scale_key, role)?, d_model, role)?,
        bias: norm_vector(require(store, bias_key, role)?, d_model, role)?,
    }))
}

fn norm_vector(t: &Tensor, d_model: usize, role: &str) -> Result<Vec<f64>> {
    let n = t
        .dims1()
        .map_err(|e| CircuitError::ShapeMismatch(format!("{}: {}", role, e)))?;
    if n != d_model {
        return Err(CircuitError::ShapeMismatch(format!(
            "{} '{}' has {} entries, expected d_model={}",
            role,
            t.name(),
            n,
            d_model
        )));
    }
    Ok(t.data().to_vec())
}

impl ModelWeights {
    /// Validate the store against `config` and pull out the named tensors.
    ///
    /// Norm parameters are required only when a toggle consumes them; they are
    /// still picked up when present.
    pub fn from_store(store: &WeightStore, config: &AnalysisConfig) -> Result<Self> {
        config.validate()?;
        let keys = &config.keys;
        let d = config.d_model;

        let embedding = require(store, &keys.embedding, "embedding table")?;
        let (vocab, emb_dim) = embedding.dims2()?;
        if emb_dim != d {
            return Err(CircuitError::Dimension(format!(
                "embedding '{}' has feature dimension {}, config says d_model={}",
                embedding.name(),
                emb_dim,
                d
            )));
        }
        if vocab == 0 {
            return Err(CircuitError::ShapeMismatch("empty vocabulary".into()));
        }

        let in_proj = require(store, &keys.in_proj, "attention in-projection")?;
        expect_shape(in_proj, &[3 * d, d], "attention in-projection")?;

        let out_proj = require(store, &keys.out_proj, "attention out-projection")?;
        expect_shape(out_proj, &[d, d], "attention out-projection")?;

        let unembedding = require(store, &keys.unembedding, "unembedding")?;
        expect_shape(unembedding, &[vocab, d], "unembedding")?;

        let attn_norm = load_norm(
            store,
            &keys.attn_norm_scale,
            &keys.attn_norm_bias,
            d,
            config.normalize_embedding || config.fold_norm_into_heads,
            "pre-attention norm",
        )?;
        let final_norm = load_norm(
            store,
            &keys.final_norm_scale,
            &keys.final_norm_bias,
            d,
            config.apply_final_layernorm,
            "final norm",
        )?;

        debug!(
            "model weights: V={} d_model={} attn_norm={} final_norm={}",
            vocab,
            d,
            attn_norm.is_some(),
            final_norm.is_some()
        );

        Ok(Self {
            in_proj: in_proj.clone(),
            out_proj: out_proj.clone(),
            embedding: embedding.clone(),
            unembedding: unembedding.clone(),
            attn_norm,
            final_norm,
        })
    }

    #[inline]
    pub fn vocab_size(&self) -> usize {
        self.embedding.shape()[0]
    }

    #[inline]
    pub fn d_model(&self) -> usize {
        self.embedding.shape()[1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{model_config, random_store};

    #[test]
    fn test_from_store_reads_every_field() {
        let config = model_config(2, 4);
        let store = random_store(&config, 7, 1);
        let w = ModelWeights::from_store(&store, &config).unwrap();
        assert_eq!(w.vocab_size(), 7);
        assert_eq!(w.d_model(), 4);
        assert!(w.attn_norm.is_some());
        assert!(w.final_norm.is_some());
    }

    #[test]
    fn test_missing_key_is_single_error() {
        let config = model_config(2, 4);
        let mut store = random_store(&config, 7, 1);
        let mut pruned = WeightStore::new();
        for t in store.sorted() {
            if t.name() != config.keys.out_proj {
                pruned.insert(t.clone());
            }
        }
        store = pruned;

        match ModelWeights::from_store(&store, &config) {
            Err(CircuitError::MissingWeight { key, .. }) => assert_eq!(key, config.keys.out_proj),
            other => panic!("expected MissingWeight, got {:?}", other),
        }
    }

    #[test]
    fn test_norms_optional_when_unused() {
        let mut config = model_config(2, 4);
        config.normalize_embedding = false;
        config.apply_final_layernorm = false;
        let full = random_store(&config, 5, 3);

        let mut store = WeightStore::new();
        for t in full.sorted() {
            if !t.name().starts_with("ln_") {
                store.insert(t.clone());
            }
        }
        let w = ModelWeights::from_store(&store, &config).unwrap();
        assert!(w.attn_norm.is_none());
        assert!(w.final_norm.is_none());

        config.apply_final_layernorm = true;
        assert!(matches!(
            ModelWeights::from_store(&store, &config),
            Err(CircuitError::MissingWeight { .. })
        ));
    }

    #[test]
    fn test_wrong_d_model_is_dimension_error() {
        let config = model_config(2, 4);
        let store = random_store(&config, 5, 3);
        let wrong = model_config(2, 6);
        assert!(matches!(
            ModelWeights::from_store(&store, &wrong),
            Err(CircuitError::Dimension(_))
        ));
    }

    #[test]
    fn test_norm_must_be_a_vector() {
        let config = model_config(2, 4);
        let mut store = random_store(&config, 5, 4);
        store.insert(Tensor::zeros(config.keys.attn_norm_scale.clone(), &[1, 4]));
        assert!(matches!(
            ModelWeights::from_store(&store, &config),
            Err(CircuitError::ShapeMismatch(_))
        ));

        store.insert(Tensor::zeros(config.keys.attn_norm_scale.clone(), &[3]));
        match ModelWeights::from_store(&store, &config) {
            Err(CircuitError::ShapeMismatch(msg)) => assert!(msg.contains("3 entries")),
            other => panic!("expected ShapeMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_bad_in_proj_is_shape_mismatch() {
        let config = model_config(2, 4);
        let mut store = random_store(&config, 5, 3);
        store.insert(Tensor::zeros(config.keys.in_proj.clone(), &[8, 4]));
        assert!(matches!(
            ModelWeights::from_store(&store, &config),
            Err(CircuitError::ShapeMismatch(_))
        ));
    }
}
