use log::debug;
use num_complex::Complex64;
use qkov_core_circuit::spectrum::polar;
use qkov_core_circuit::{AnalysisConfig, RankedTokens, TokenRecord};
use qkov_core_tensor::{Tensor, WeightStore};
use std::fmt::Write;

pub fn render_header(config: &AnalysisConfig, vocab_size: usize) -> String {
    format!(
        "Model\n  n_head: {}\n  d_model: {}\n  d_head: {}\n  vocab_size: {}\n\
         Analysis\n  normalize_embedding: {}\n  apply_final_layernorm: {}\n  \
         fold_norm_into_heads: {}\n  baseline: {} ({:?})\n  top_k: {}\n  block_size: {}",
        config.n_head,
        config.d_model,
        config.d_head(),
        vocab_size,
        config.normalize_embedding,
        config.apply_final_layernorm,
        config.fold_norm_into_heads,
        config.baseline_mode,
        config.average_strategy,
        config.top_k,
        config.block_size
    )
}

fn tensor_line(t: &Tensor) -> String {
    format!("{}: shape={:?}, elements={}", t.name(), t.shape(), t.num_elements())
}

pub fn render_tensor_summary(store: &WeightStore, name: &str) -> Option<String> {
    store.get(name).map(tensor_line)
}

/// One line per tensor, ordered by name.
pub fn render_all_tensor_summaries(store: &WeightStore) -> impl Iterator<Item = String> + '_ {
    store.sorted().into_iter().map(tensor_line)
}

pub fn render_ranked(title: &str, ranked: &RankedTokens) -> String {
    let mut buf = String::new();
    let _ = writeln!(buf, "  {}:", title);
    for (rank, ((id, tok), score)) in ranked
        .token_ids
        .iter()
        .zip(&ranked.tokens)
        .zip(&ranked.scores)
        .enumerate()
    {
        let _ = writeln!(buf, "    {:>2}. {:>7} {:<20} {:>12.6}", rank + 1, id, format!("{:?}", tok), score);
    }
    buf
}

pub fn render_token_report(head: usize, record: &TokenRecord) -> String {
    debug!("render_token_report head={} token={}", head, record.token_id);
    let mut buf = format!("Head {} / source token {}\n", head, record.token_id);
    buf.push_str(&render_ranked("source -> out (OV)", &record.source_to_out));
    buf.push_str(&render_ranked("source -> dest (QK)", &record.source_to_dest));
    let _ = write!(buf, "  combined_score: {:.6}", record.combined_score);
    buf
}

/// Eigenvalues with their polar coordinates, largest magnitude first.
pub fn render_spectrum(head: usize, eigenvalues: &[Complex64]) -> String {
    let mut sorted = eigenvalues.to_vec();
    sorted.sort_by(|a, b| b.norm().total_cmp(&a.norm()));
    let real = sorted.iter().filter(|z| z.im == 0.0).count();

    let mut buf = format!(
        "Head {} OV spectrum ({} eigenvalues, {} real)\n",
        head,
        sorted.len(),
        real
    );
    for (z, (angle, log_mag)) in sorted.iter().zip(polar(&sorted)) {
        let _ = writeln!(
            buf,
            "  {:>12.6} {:+12.6}i   |λ|={:<10.6} angle={:+.4} ln|λ|={:+.4}",
            z.re,
            z.im,
            z.norm(),
            angle,
            log_mag
        );
    }
    buf
}

/// Positional attention logits, one line per query position, with the key
/// position it favours.
pub fn render_positional(head: usize, rows: &[Vec<f64>]) -> String {
    let mut buf = format!("Head {} positional attention ({} positions)\n", head, rows.len());
    for (i, row) in rows.iter().enumerate() {
        let peak = row
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(j, _)| j)
            .unwrap_or(0);
        let cells: Vec<String> = row.iter().map(|x| format!("{:+8.3}", x)).collect();
        let _ = writeln!(buf, "  {:>4} -> {:>4} |{}", i, peak, cells.join(""));
    }
    buf
}
