use clap::{Args, ValueEnum};
use once_cell::sync::OnceCell;
use std::path::PathBuf;

static INIT_SYNC: std::sync::Once = std::sync::Once::new();
static GLOBAL_OPTS: OnceCell<GlobalOpts> = OnceCell::new();

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
pub enum OutputFormat {
    Pretty,
    Json,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    // write output to a file instead of stdout
    #[arg(short = 'o', long, value_name = "PATH", global = true)]
    pub output: Option<PathBuf>,

    // pretty | json
    #[arg(
        short = 'F',
        long,
        value_enum,
        default_value = "pretty",
        value_name = "FMT",
        global = true
    )]
    pub format: OutputFormat,

    #[arg(short = 't', long, help = "Number of threads (optional)")]
    pub threads: Option<usize>,

    // verbosity (-v, -vv, etc.)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

fn level_filter(level: u8) -> String {
    let level = match level {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    format!("qkov={}", level)
}

/// -v flags pick the level for every `qkov*` crate; RUST_LOG still wins when set.
pub fn setup_logging(level: u8) {
    let env = env_logger::Env::default().default_filter_or(level_filter(level));
    let _ = env_logger::Builder::from_env(env).try_init();
}

pub fn setup_rayon(threads: Option<usize>) -> Result<(), rayon::ThreadPoolBuildError> {
    let mut result = Ok(());
    INIT_SYNC.call_once(|| {
        let mut builder = rayon::ThreadPoolBuilder::new();
        if let Some(n) = threads {
            builder = builder.num_threads(n);
        }
        result = builder.build_global();
    });
    result
}

#[derive(Debug, thiserror::Error)]
pub enum GlobalsError {
    #[error("global options already initialized")]
    AlreadyInitialized,
    #[error("failed to build global thread pool: {0}")]
    ThreadPool(rayon::ThreadPoolBuildError),
}

pub fn init_globals(opts: GlobalOpts) -> Result<&'static GlobalOpts, GlobalsError> {
    GLOBAL_OPTS
        .set(opts)
        .map_err(|_| GlobalsError::AlreadyInitialized)?;
    let opts = get_globals().ok_or(GlobalsError::AlreadyInitialized)?;

    // logging
    setup_logging(opts.verbose);
    // threading
    setup_rayon(opts.threads).map_err(GlobalsError::ThreadPool)?;
    Ok(opts)
}

pub fn get_globals() -> Option<&'static GlobalOpts> {
    GLOBAL_OPTS.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        g: GlobalOpts,
    }

    #[test]
    fn test_defaults_and_flags() {
        let cli = TestCli::parse_from(["qkov"]);
        assert_eq!(cli.g.format, OutputFormat::Pretty);
        assert_eq!(cli.g.verbose, 0);
        assert!(cli.g.output.is_none());

        let cli = TestCli::parse_from(["qkov", "-F", "json", "-vv", "-t", "3", "-o", "out.json"]);
        assert_eq!(cli.g.format, OutputFormat::Json);
        assert_eq!(cli.g.verbose, 2);
        assert_eq!(cli.g.threads, Some(3));
        assert_eq!(cli.g.output, Some(PathBuf::from("out.json")));
    }

    #[test]
    fn test_level_filter() {
        assert_eq!(level_filter(0), "qkov=info");
        assert_eq!(level_filter(1), "qkov=debug");
        assert_eq!(level_filter(7), "qkov=trace");
    }
}
