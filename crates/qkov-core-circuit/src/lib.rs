//! OV/QK circuit analysis of one-layer attention-only transformers.
//!
//! An [`AnalysisSession`] slices every head out of the packed attention
//! weights, builds the shared embedding/unembedding, and answers per-head
//! queries: which output tokens a source token promotes (OV), which query
//! tokens attend to it (QK, against a baseline), how positions attend to
//! positions, and the eigenvalues of the head's OV operator.

pub mod baseline;
pub mod cancel;
pub mod composer;
pub mod config;
pub mod embedding;
pub mod error;
pub mod export;
pub mod forward;
pub mod positional;
pub mod rank;
pub mod session;
pub mod slicer;
pub mod spectrum;
pub mod tokenizer;
pub mod weights;

#[cfg(test)]
mod testutil;

pub use baseline::{Baseline, BaselineCache};
pub use cancel::Cancellation;
pub use config::{AnalysisConfig, AverageStrategy, BaselineMode, WeightKeys};
pub use error::{CircuitError, Result};
pub use export::{ExportDocument, TokenRecord};
pub use rank::{Ranked, RankedTokens};
pub use session::AnalysisSession;
pub use slicer::HeadWeights;
pub use tokenizer::{Tokenizer, VocabTokenizer};
pub use weights::ModelWeights;
