use clap::{Args, Parser, ValueEnum};
use qkov_core_circuit::BaselineMode;
use qkov_globals::GlobalOpts;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "qkov-info",
    version = env!("CARGO_PKG_VERSION"),
    about = "OV/QK circuit inspection for one-layer attention-only transformers."
)]
pub struct Cli {
    #[command(flatten)]
    pub g: GlobalOpts,

    #[command(flatten)]
    pub args: InfoArgs,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum BaselineArg {
    #[value(alias = "start_token")]
    Start,
    #[value(alias = "vocabulary_average", alias = "avg")]
    Average,
}

impl From<BaselineArg> for BaselineMode {
    fn from(b: BaselineArg) -> Self {
        match b {
            BaselineArg::Start => BaselineMode::StartToken,
            BaselineArg::Average => BaselineMode::VocabularyAverage,
        }
    }
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// Weights as JSON: { "<name>": { "shape": [..], "data": [..] } }
    #[arg(short = 'w', long, value_name = "FILE", value_hint = clap::ValueHint::FilePath,
          required_unless_present = "blob", conflicts_with = "blob")]
    pub weights: Option<PathBuf>,

    /// Raw little-endian weight blob (needs --index)
    #[arg(long, value_name = "FILE", requires = "index")]
    pub blob: Option<PathBuf>,

    /// JSON tensor index describing --blob
    #[arg(long, value_name = "FILE")]
    pub index: Option<PathBuf>,

    /// Vocabulary: JSON array of token strings
    #[arg(long, value_name = "FILE")]
    pub vocab: Option<PathBuf>,

    /// Analysis config as JSON; flags below override it
    #[arg(short = 'c', long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[arg(long)]
    pub n_head: Option<usize>,

    #[arg(long)]
    pub d_model: Option<usize>,

    #[arg(short = 'k', long)]
    pub top_k: Option<usize>,

    #[arg(long, value_enum)]
    pub baseline: Option<BaselineArg>,

    /// Vocabulary-average baseline from one chain on the mean embedding
    #[arg(long)]
    pub closed_form: bool,

    /// Skip embedding standardization + pre-attention norm
    #[arg(long)]
    pub no_normalize: bool,

    /// Skip folding the final norm scale into the unembedding
    #[arg(long)]
    pub no_final_norm: bool,

    /// Fold the pre-attention norm into each head instead of the embedding
    #[arg(long, conflicts_with = "no_normalize")]
    pub fold_norm: bool,

    /// Restrict to one head
    #[arg(long)]
    pub head: Option<usize>,

    /// Source token as text (must encode to exactly one token)
    #[arg(long, conflicts_with = "token_id")]
    pub token: Option<String>,

    /// Source token by id
    #[arg(long)]
    pub token_id: Option<u32>,

    /// Show the model/analysis header
    #[arg(long)]
    pub header: bool,

    /// List tensors in the weight store
    #[arg(long)]
    pub list_tensors: bool,

    /// Summary of one named tensor (repeatable)
    #[arg(long = "tensor", value_name = "NAME")]
    pub tensors: Vec<String>,

    /// Write the loaded weights to a new JSON file
    #[arg(long, value_name = "FILE")]
    pub dump_weights: Option<PathBuf>,

    /// Eigenvalues of each head's OV operator
    #[arg(long)]
    pub spectrum: bool,

    /// Position-only attention logits of each head
    #[arg(long)]
    pub positional: bool,

    /// Positions covered by --positional
    #[arg(long)]
    pub block_size: Option<usize>,

    /// Bulk export of per-token circuits to a new JSON file
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    #[arg(long, default_value_t = 0)]
    pub first: u32,

    #[arg(long, default_value_t = 100)]
    pub last: u32,

    /// Directory for write-once baseline files
    #[arg(long, value_name = "DIR")]
    pub baseline_cache: Option<PathBuf>,

    /// Give up on long scans after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl InfoArgs {
    pub fn needs_baselines(&self) -> bool {
        self.token.is_some() || self.token_id.is_some() || self.export.is_some()
    }
}
