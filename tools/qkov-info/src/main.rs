mod cli;

use crate::cli::{Cli, InfoArgs};
use anyhow::{Context, bail};
use clap::Parser;
use log::{debug, info, warn};
use qkov_core_circuit::export::{export, write_json};
use qkov_core_circuit::spectrum::polar;
use qkov_core_circuit::{
    AnalysisConfig, AnalysisSession, AverageStrategy, BaselineCache, Cancellation, TokenRecord,
    Tokenizer, VocabTokenizer,
};
use qkov_core_info::{
    render_all_tensor_summaries, render_header, render_positional, render_spectrum,
    render_tensor_summary, render_token_report,
};
use qkov_core_tensor::WeightStore;
use qkov_globals::{GlobalOpts, OutputFormat, init_globals};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct HeadReport {
    head: usize,
    #[serde(flatten)]
    record: TokenRecord,
}

#[derive(Debug, Serialize)]
struct HeadSpectrum {
    head: usize,
    /// `[re, im]` pairs
    eigenvalues: Vec<[f64; 2]>,
    /// `[angle, ln |λ|]` pairs
    polar: Vec<[f64; 2]>,
}

#[derive(Debug, Serialize)]
struct HeadPositional {
    head: usize,
    /// `scores[i][j]`: query position `i`, key position `j`
    scores: Vec<Vec<f64>>,
}

#[derive(Debug, Default, Serialize)]
struct Report {
    #[serde(skip_serializing_if = "Option::is_none")]
    config: Option<AnalysisConfig>,
    vocab_size: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tensors: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    reports: Vec<HeadReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    spectra: Vec<HeadSpectrum>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    positional: Vec<HeadPositional>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dumped_weights: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    export: Option<PathBuf>,
}

fn load_store(cmd: &InfoArgs) -> anyhow::Result<WeightStore> {
    match (&cmd.weights, &cmd.blob, &cmd.index) {
        (Some(json), _, _) => WeightStore::from_json_file(json),
        (None, Some(blob), Some(index)) => WeightStore::from_blob_files(index, blob),
        _ => bail!("no weights given (use --weights or --blob with --index)"),
    }
}

fn load_config(cmd: &InfoArgs) -> anyhow::Result<AnalysisConfig> {
    let mut config = match &cmd.config {
        Some(path) => AnalysisConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => AnalysisConfig::default(),
    };
    if let Some(n) = cmd.n_head {
        config.n_head = n;
    }
    if let Some(d) = cmd.d_model {
        config.d_model = d;
    }
    if let Some(k) = cmd.top_k {
        config.top_k = k;
    }
    if let Some(b) = cmd.block_size {
        config.block_size = b;
    }
    if let Some(b) = cmd.baseline {
        config.baseline_mode = b.into();
    }
    if cmd.closed_form {
        config.average_strategy = AverageStrategy::ClosedForm;
    }
    if cmd.no_normalize || cmd.fold_norm {
        config.normalize_embedding = false;
    }
    if cmd.no_final_norm {
        config.apply_final_layernorm = false;
    }
    if cmd.fold_norm {
        config.fold_norm_into_heads = true;
    }
    config.validate()?;
    Ok(config)
}

fn load_tokenizer(cmd: &InfoArgs, vocab_size: usize) -> anyhow::Result<VocabTokenizer> {
    match &cmd.vocab {
        Some(path) => {
            let tok = VocabTokenizer::from_json_file(path)
                .with_context(|| format!("reading vocabulary {}", path.display()))?;
            if tok.vocab_size() != vocab_size {
                warn!(
                    "vocabulary has {} entries, model has {}",
                    tok.vocab_size(),
                    vocab_size
                );
            }
            Ok(tok)
        }
        None => {
            debug!("no vocabulary given, decoding ids as <id>");
            Ok(VocabTokenizer::new((0..vocab_size).map(|i| format!("<{i}>")).collect()))
        }
    }
}

fn dump_weights(store: &WeightStore, path: &Path) -> anyhow::Result<()> {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("creating {}", path.display()))?;
    let mut out = std::io::BufWriter::new(file);
    store.to_json_writer(&mut out)?;
    out.flush()?;
    info!("{} tensors written to {}", store.len(), path.display());
    Ok(())
}

/// All CPU-bound work; runs on the blocking pool.
fn analyze(cmd: InfoArgs, cancel: Cancellation) -> anyhow::Result<Report> {
    let store = load_store(&cmd)?;
    let config = load_config(&cmd)?;
    let mut report = Report::default();

    if cmd.list_tensors {
        report.tensors = render_all_tensor_summaries(&store).collect();
    }
    for name in &cmd.tensors {
        let line = render_tensor_summary(&store, name)
            .with_context(|| format!("no tensor named '{}'", name))?;
        report.tensors.push(line);
    }
    if let Some(path) = &cmd.dump_weights {
        dump_weights(&store, path)?;
        report.dumped_weights = Some(path.clone());
    }

    let mut session = AnalysisSession::new(&store, config)?;
    drop(store);
    report.vocab_size = session.vocab_size();
    if cmd.header {
        report.config = Some(session.config().clone());
    }

    let heads: Vec<usize> = match cmd.head {
        Some(h) => {
            session.head(h)?;
            vec![h]
        }
        None => (0..session.heads().len()).collect(),
    };

    if cmd.spectrum {
        let spectra = session.spectra_for(&heads)?;
        for (&h, ev) in heads.iter().zip(&spectra) {
            report.spectra.push(HeadSpectrum {
                head: h,
                eigenvalues: ev.iter().map(|z| [z.re, z.im]).collect(),
                polar: polar(ev).into_iter().map(|(a, m)| [a, m]).collect(),
            });
        }
    }

    if cmd.positional {
        for &h in &heads {
            let scores = session.positional_attention(h)?;
            report.positional.push(HeadPositional {
                head: h,
                scores: scores.data().chunks(scores.shape()[1]).map(<[f64]>::to_vec).collect(),
            });
        }
    }

    if !cmd.needs_baselines() {
        return Ok(report);
    }

    let cache = cmd
        .baseline_cache
        .as_ref()
        .map(BaselineCache::new)
        .transpose()?;
    // the bulk export walks every head
    if cmd.export.is_some() {
        session.compute_baselines(cache.as_ref(), &cancel)?;
    } else {
        session.compute_baselines_for(&heads, cache.as_ref(), &cancel)?;
    }
    let tokenizer = load_tokenizer(&cmd, session.vocab_size())?;

    let source: Option<Vec<u32>> = match (&cmd.token, cmd.token_id) {
        (Some(text), _) => Some(tokenizer.encode(text)),
        (None, Some(id)) => Some(vec![id]),
        (None, None) => None,
    };
    if let Some(tokens) = source {
        debug!("source tokens: {:?}", tokens);
        for &h in &heads {
            let record = session.token_report(h, &tokens, &tokenizer)?;
            report.reports.push(HeadReport { head: h, record });
        }
    }

    if let Some(path) = &cmd.export {
        let doc = export(&session, cmd.first..=cmd.last, &tokenizer, &cancel)?;
        write_json(path, &doc)?;
        report.export = Some(path.clone());
    }

    Ok(report)
}

fn render_pretty(report: &Report) -> String {
    let mut sections = Vec::new();
    if let Some(config) = &report.config {
        sections.push(render_header(config, report.vocab_size));
    }
    if !report.tensors.is_empty() {
        sections.push(format!("Tensors\n  {}", report.tensors.join("\n  ")));
    }
    for r in &report.reports {
        sections.push(render_token_report(r.head, &r.record));
    }
    for s in &report.spectra {
        let ev: Vec<_> = s
            .eigenvalues
            .iter()
            .map(|[re, im]| num_complex::Complex64::new(*re, *im))
            .collect();
        sections.push(render_spectrum(s.head, &ev));
    }
    for p in &report.positional {
        sections.push(render_positional(p.head, &p.scores));
    }
    if let Some(path) = &report.dumped_weights {
        sections.push(format!("Weights written to {}", path.display()));
    }
    if let Some(path) = &report.export {
        sections.push(format!("Export written to {}", path.display()));
    }
    sections.join("\n\n")
}

pub async fn run_info_cmd(cmd: InfoArgs, globals: &GlobalOpts) -> anyhow::Result<()> {
    debug!("qkov-info args: {:#?}", &cmd);

    let mut cancel = Cancellation::new();
    if let Some(secs) = cmd.timeout {
        cancel = cancel.with_timeout(Duration::from_secs(secs));
    }

    // Ctrl-C stops long scans at the next token boundary
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            on_signal.cancel();
        }
    });

    let report = tokio::task::spawn_blocking(move || analyze(cmd, cancel)).await??;

    let text = match globals.format {
        OutputFormat::Pretty => render_pretty(&report),
        OutputFormat::Json => serde_json::to_string_pretty(&report)?,
    };
    match &globals.output {
        Some(path) => {
            std::fs::write(path, text.as_bytes())
                .with_context(|| format!("writing {}", path.display()))?;
            info!("output written to {}", path.display());
        }
        None => {
            let mut out = std::io::stdout().lock();
            writeln!(out, "{}", text)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let globals = init_globals(cli.g)?;
    run_info_cmd(cli.args, globals).await
}
