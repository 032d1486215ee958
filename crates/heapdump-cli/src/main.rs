use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use facet::Facet;
use figue as args;
use heapdump::{
    Config, Dumper, Flags, Isolation, ManagedHeap, OPTIONS_ENV, SnapshotInfo, SnapshotRequest,
};

mod demo;

const DEFAULT_OBJECTS: usize = 1_000;
const DEFAULT_CHURN_MS: u64 = 50;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    #[facet(args::subcommand)]
    command: Command,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum Command {
    /// Write one snapshot of a freshly built demo heap.
    Write {
        #[facet(args::named, default)]
        path: Option<String>,
        #[facet(args::named, default)]
        objects: Option<usize>,
        #[facet(args::named, default)]
        fork: bool,
    },
    /// Run a mutating demo heap with the signal trigger armed until Ctrl-C.
    Serve {
        #[facet(args::named, default)]
        objects: Option<usize>,
        #[facet(args::named, default)]
        churn_ms: Option<u64>,
    },
    /// Show the flags an option string resolves to.
    Options {
        #[facet(args::named, default)]
        raw: Option<String>,
    },
}

#[derive(Facet)]
struct WriteReport {
    path: String,
    nodes: u64,
    edges: u64,
    bytes: u64,
    isolation: Isolation,
}

impl From<SnapshotInfo> for WriteReport {
    fn from(info: SnapshotInfo) -> Self {
        Self {
            path: info.path.display().to_string(),
            nodes: info.nodes,
            edges: info.edges,
            bytes: info.bytes,
            isolation: info.isolation,
        }
    }
}

#[derive(Facet)]
struct OptionsReport {
    raw: String,
    flags: String,
    bits: u32,
    no_fork: bool,
    no_signal: bool,
    unrecognized: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("heapdump")
                .description("Capture heap snapshots of a demo managed heap")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();
    let cli = args::Driver::new(figue_config)
        .run()
        .into_result()
        .map_err(|e| e.to_string())?;

    match cli.value.command {
        Command::Write {
            path,
            objects,
            fork,
        } => run_write(path, objects, fork),
        Command::Serve { objects, churn_ms } => run_serve(objects, churn_ms),
        Command::Options { raw } => run_options(raw),
    }
}

fn demo_heap(objects: Option<usize>) -> Result<(Arc<ManagedHeap>, demo::DemoHeap), String> {
    let heap = ManagedHeap::new();
    let handles = demo::populate(&heap, objects.unwrap_or(DEFAULT_OBJECTS))
        .map_err(|e| format!("build demo heap: {e}"))?;
    Ok((Arc::new(heap), handles))
}

fn run_write(path: Option<String>, objects: Option<usize>, fork: bool) -> Result<(), String> {
    let (heap, _) = demo_heap(objects)?;
    let config = Config::from_env();
    let mut flags = config.flags.with(Flags::NO_SIGNAL);
    if fork {
        flags = flags.without(Flags::NO_FORK);
    }
    let dumper = Dumper::builder(heap)
        .config(config)
        .flags(flags)
        .build()
        .map_err(|e| format!("configure heapdump: {e}"))?;

    let mut request = SnapshotRequest::new();
    if let Some(path) = path {
        request = request.path(PathBuf::from(path));
    }
    let info = dumper
        .write_snapshot(request)
        .wait()
        .map_err(|e| format!("capture failed: {e}"))?;

    println!(
        "{}",
        facet_json::to_string_pretty(&WriteReport::from(info))
            .map_err(|e| format!("encode snapshot info: {e}"))?
    );
    Ok(())
}

fn run_serve(objects: Option<usize>, churn_ms: Option<u64>) -> Result<(), String> {
    let (heap, handles) = demo_heap(objects)?;
    let config = Config::from_env();
    let flags = config.flags.without(Flags::NO_SIGNAL);
    let dumper = Dumper::builder(Arc::clone(&heap))
        .config(config)
        .flags(flags)
        .build()
        .map_err(|e| format!("configure heapdump: {e}"))?;
    let signal = dumper
        .signal()
        .ok_or_else(|| "signal trigger was not installed".to_string())?;
    let interval = Duration::from_millis(churn_ms.unwrap_or(DEFAULT_CHURN_MS).max(1));

    tracing::info!(
        pid = std::process::id(),
        signal,
        output_dir = %dumper.config().output_dir.display(),
        "serving demo heap; send the signal to capture, Ctrl-C to stop"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to build tokio runtime: {e}"))?;
    runtime.block_on(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut tick = 0u64;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tick += 1;
                    match demo::churn(&heap, handles, tick) {
                        Ok(0) => {}
                        Ok(freed) => tracing::debug!(tick, freed, "collected"),
                        Err(e) => return Err(format!("mutator failed: {e}")),
                    }
                }
                result = tokio::signal::ctrl_c() => {
                    result.map_err(|e| format!("wait for Ctrl-C: {e}"))?;
                    tracing::info!(ticks = tick, state = ?dumper.state(), "shutting down");
                    return Ok(());
                }
            }
        }
    })
}

fn run_options(raw: Option<String>) -> Result<(), String> {
    let raw = raw
        .or_else(|| std::env::var(OPTIONS_ENV).ok())
        .unwrap_or_default();
    let parsed = Flags::parse_options(&raw);
    for token in &parsed.unrecognized {
        tracing::warn!(option = %token, "unrecognized option");
    }
    let report = OptionsReport {
        flags: parsed.flags.to_string(),
        bits: parsed.flags.bits(),
        no_fork: parsed.flags.no_fork(),
        no_signal: parsed.flags.no_signal(),
        unrecognized: parsed.unrecognized,
        raw,
    };
    println!(
        "{}",
        facet_json::to_string_pretty(&report).map_err(|e| format!("encode options: {e}"))?
    );
    Ok(())
}
