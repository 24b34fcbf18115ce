//! pipemux-worker: serve the pipemux protocol on stdin/stdout.
//!
//! Logs go to stderr; stdout carries the multiplexed stream.

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use pipemux::{PathResolver, WorkerConfig, run_worker};

const USAGE: &str = "\
Usage: pipemux-worker [--label <name>] [--workdir <dir>] [--bind <host>] [--max-ops <n>]

Options:
  --label <name>    Name used in diagnostics [default: worker]
  --workdir <dir>   Base for relative paths and exec directories [default: .]
  --bind <host>     Address socket tunnels listen on [default: 127.0.0.1]
  --max-ops <n>     Concurrent exec/push handlers [default: 512]";

#[derive(Debug, Default, PartialEq)]
struct Args {
    label: Option<String>,
    workdir: Option<PathBuf>,
    bind: Option<String>,
    max_ops: Option<usize>,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match flag {
            "--label" => parsed.label = Some(value()?),
            "--workdir" => parsed.workdir = Some(PathBuf::from(value()?)),
            "--bind" => parsed.bind = Some(value()?),
            "--max-ops" => {
                let raw = value()?;
                let n = raw
                    .parse::<usize>()
                    .map_err(|_| format!("invalid --max-ops value '{raw}'"))?;
                parsed.max_ops = Some(n);
            }
            "--help" | "-h" => return Err(String::new()),
            other => return Err(format!("unexpected argument: {other}")),
        }
        i += 1;
    }
    Ok(parsed)
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PIPEMUX_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("pipemux={level},pipemux_worker={level}"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn build_config(args: Args) -> anyhow::Result<WorkerConfig> {
    let mut config = WorkerConfig::default();
    if let Some(label) = args.label {
        config = config.with_label(label);
    }
    if let Some(dir) = args.workdir {
        let dir = std::path::absolute(&dir)
            .with_context(|| format!("invalid working directory {}", dir.display()))?;
        config = config.with_paths(PathResolver::from_env().with_working_dir(dir));
    }
    if let Some(host) = args.bind {
        config = config.with_bind_host(host);
    }
    if let Some(n) = args.max_ops {
        config = config.with_max_concurrent_operations(n);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let argv: Vec<String> = std::env::args().collect();
    let args = match parse_args(&argv) {
        Ok(args) => args,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };

    init_tracing();
    let config = build_config(args)?;
    tracing::info!(
        version = pipemux::PIPEMUX_VERSION,
        label = %config.label,
        workdir = %config.paths.working_dir().display(),
        "pipemux-worker starting"
    );

    run_worker(tokio::io::stdin(), tokio::io::stdout(), config)
        .await
        .context("worker stopped with an error")?;
    Ok(())
}
