//! Bulk export of per-token circuit summaries.

use log::info;
use rayon::prelude::*;
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::ops::RangeInclusive;
use std::path::Path;

use crate::cancel::Cancellation;
use crate::config::BaselineMode;
use crate::error::{CircuitError, Result};
use crate::rank::RankedTokens;
use crate::session::AnalysisSession;
use crate::tokenizer::Tokenizer;

/// OV and QK summary of one source token through one head.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenRecord {
    pub token_id: u32,
    pub source_to_out: RankedTokens,
    pub source_to_dest: RankedTokens,
    /// Top OV score times top QK score.
    pub combined_score: f64,
}

impl TokenRecord {
    pub fn new(token_id: u32, source_to_out: RankedTokens, source_to_dest: RankedTokens) -> Self {
        let combined_score = source_to_out
            .top_score()
            .zip(source_to_dest.top_score())
            .map_or(0.0, |(o, d)| o * d);
        Self {
            token_id,
            source_to_out,
            source_to_dest,
            combined_score,
        }
    }
}

/// The export file: records indexed `[head][token - first_token]`.
#[derive(Debug, Clone, Serialize)]
pub struct ExportDocument {
    pub baseline_mode: BaselineMode,
    pub top_k: usize,
    pub first_token: u32,
    pub last_token: u32,
    pub heads: Vec<Vec<TokenRecord>>,
}

/// Token reports for every head over `tokens`.
///
/// Heads run in parallel when the session allows it; `cancel` is polled
/// before every token.
pub fn scan(
    session: &AnalysisSession,
    tokens: RangeInclusive<u32>,
    tokenizer: &dyn Tokenizer,
    cancel: &Cancellation,
) -> Result<Vec<Vec<TokenRecord>>> {
    let vocab = session.vocab_size();
    if tokens.is_empty() {
        return Err(CircuitError::InvalidInput(format!(
            "empty token range {}..={}",
            tokens.start(),
            tokens.end()
        )));
    }
    if *tokens.end() as usize >= vocab {
        return Err(CircuitError::TokenOutOfRange {
            token: *tokens.end(),
            vocab,
        });
    }
    let total = tokens.clone().count();

    let one_head = |h: usize| -> Result<Vec<TokenRecord>> {
        let mut records = Vec::with_capacity(total);
        for (i, t) in tokens.clone().enumerate() {
            cancel.check(i, total)?;
            records.push(session.token_report(h, &[t], tokenizer)?);
        }
        info!("head {}: exported {} tokens", h, total);
        Ok(records)
    };

    let n_heads = session.heads().len();
    if session.config().parallel {
        (0..n_heads).into_par_iter().map(one_head).collect()
    } else {
        (0..n_heads).map(one_head).collect()
    }
}

pub fn export(
    session: &AnalysisSession,
    tokens: RangeInclusive<u32>,
    tokenizer: &dyn Tokenizer,
    cancel: &Cancellation,
) -> Result<ExportDocument> {
    let heads = scan(session, tokens.clone(), tokenizer, cancel)?;
    Ok(ExportDocument {
        baseline_mode: session.config().baseline_mode,
        top_k: session.config().top_k,
        first_token: *tokens.start(),
        last_token: *tokens.end(),
        heads,
    })
}

/// Write `doc` as JSON to a new file; an existing file is an error.
pub fn write_json(path: &Path, doc: &ExportDocument) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let mut w = BufWriter::new(file);
    serde_json::to_writer(&mut w, doc)?;
    w.flush()?;
    info!("export written to {}", path.display());
    Ok(())
}
