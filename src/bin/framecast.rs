use std::{path::PathBuf, sync::Arc};

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use framecast::{
    CacheScanner, ClockClient, Config, CountingSink, FrameSink, MetadataStore, PngSink,
    StreamClient, StreamOutcome, StreamServer,
    store::{AssetRecord, CacheEntry, StreamSession},
};

#[derive(Parser, Debug)]
#[command(name = "framecast", version)]
struct Cli {
    /// TOML config file; every setting has a default.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cache scanner and the stream server.
    Serve(ServeArgs),
    /// Run one scan, populate and evict pass, then exit.
    Scan(PathArgs),
    /// Stream an animation and write its frames as PNGs.
    Play(PlayArgs),
    /// Receive QR clock frames and write them as PNGs.
    Clock(ClockArgs),
    /// Print the catalog, cache entries and recent sessions as JSON.
    Status(StatusArgs),
}

#[derive(Parser, Debug)]
struct PathArgs {
    /// Directory of source GIFs.
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Root of the frame cache.
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// Catalog database file.
    #[arg(long)]
    catalog: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct ServeArgs {
    #[command(flatten)]
    paths: PathArgs,

    #[arg(long)]
    port: Option<u16>,

    /// Target send rate in frames per second.
    #[arg(long)]
    fps: Option<f64>,
}

#[derive(Parser, Debug)]
struct RemoteArgs {
    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    /// Directory for PNG output; frames are only counted when omitted.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct PlayArgs {
    #[command(flatten)]
    remote: RemoteArgs,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Asset to request; the server picks one when omitted.
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    from: Option<u32>,

    #[arg(long)]
    to: Option<u32>,
}

#[derive(Parser, Debug)]
struct ClockArgs {
    #[command(flatten)]
    remote: RemoteArgs,

    /// Hours added to UTC.
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    offset: f64,

    /// Frames to receive (one per second).
    #[arg(long, default_value_t = 5)]
    frames: u32,
}

#[derive(Parser, Debug)]
struct StatusArgs {
    #[arg(long)]
    catalog: Option<PathBuf>,

    /// Most recent sessions to include.
    #[arg(long, default_value_t = 20)]
    sessions: usize,
}

#[derive(Serialize)]
struct StatusReport {
    assets: Vec<AssetRecord>,
    caches: Vec<CacheEntry>,
    sessions: Vec<StreamSession>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    match cli.cmd {
        Command::Serve(args) => cmd_serve(cfg, args).await,
        Command::Scan(args) => cmd_scan(cfg, args).await,
        Command::Play(args) => cmd_play(cfg, args).await,
        Command::Clock(args) => cmd_clock(cfg, args).await,
        Command::Status(args) => cmd_status(cfg, args),
    }
}

fn apply_paths(cfg: &mut Config, paths: PathArgs) {
    if let Some(dir) = paths.source_dir {
        cfg.scanner.source_dir = dir;
    }
    if let Some(dir) = paths.cache_root {
        cfg.scanner.cache_root = dir;
    }
    if let Some(path) = paths.catalog {
        cfg.store.catalog_path = path;
    }
}

fn apply_remote(cfg: &mut Config, remote: &RemoteArgs) {
    if let Some(host) = &remote.host {
        cfg.client.host = host.clone();
    }
    if let Some(port) = remote.port {
        cfg.client.port = port;
    }
}

fn open_store(cfg: &Config) -> anyhow::Result<Arc<MetadataStore>> {
    let store = MetadataStore::open(&cfg.store.catalog_path, cfg.store.session_log_limit)
        .with_context(|| format!("open catalog '{}'", cfg.store.catalog_path.display()))?;
    Ok(Arc::new(store))
}

fn make_sink(out: Option<PathBuf>) -> anyhow::Result<Box<dyn FrameSink>> {
    Ok(match out {
        Some(dir) => Box::new(PngSink::new(dir)?),
        None => Box::new(CountingSink::default()),
    })
}

async fn cmd_serve(mut cfg: Config, args: ServeArgs) -> anyhow::Result<()> {
    apply_paths(&mut cfg, args.paths);
    if let Some(port) = args.port {
        cfg.server.port = port;
    }
    if let Some(fps) = args.fps {
        cfg.server.target_fps = fps;
    }

    let store = open_store(&cfg)?;
    let stale = store.reset_readers()?;
    if stale > 0 {
        tracing::info!(entries = stale, "cleared reader counts left by a previous server");
    }
    let cancel = CancellationToken::new();
    let scanner = CacheScanner::new(Arc::clone(&store), cfg.scanner.clone());
    let cache = scanner.cache().clone();
    let scanner = scanner.spawn(cancel.child_token());

    let server = StreamServer::new(store, cache, cfg.scanner.source_dir.clone(), cfg.server);
    let listener = server.bind().await?;
    let serving = tokio::spawn({
        let cancel = cancel.clone();
        async move { server.serve(listener, cancel).await }
    });

    wait_for_shutdown(&scanner).await?;
    tracing::info!("shutting down");
    cancel.cancel();
    scanner.join().await;
    serving.await.context("server task")??;
    Ok(())
}

/// Block until Ctrl-C or SIGTERM, forwarding SIGUSR1 to the scanner as a scan request.
#[cfg(unix)]
async fn wait_for_shutdown(scanner: &framecast::ScannerHandle) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut usr1 = signal(SignalKind::user_defined1()).context("install SIGUSR1 handler")?;
    let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = term.recv() => return Ok(()),
            _ = usr1.recv() => {
                tracing::info!("SIGUSR1 received, scanning now");
                scanner.scan_now();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_scanner: &framecast::ScannerHandle) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("wait for Ctrl-C")?;
    Ok(())
}

async fn cmd_scan(mut cfg: Config, args: PathArgs) -> anyhow::Result<()> {
    apply_paths(&mut cfg, args);
    let store = open_store(&cfg)?;
    let scanner = CacheScanner::new(store, cfg.scanner);
    let report = tokio::task::spawn_blocking(move || scanner.run_pass())
        .await
        .context("scan task")??;

    println!(
        "scan: {} added, {} modified, {} unchanged, {} removed, {} skipped",
        report.scan.added,
        report.scan.modified,
        report.scan.unchanged,
        report.scan.removed,
        report.scan.skipped
    );
    for (res, populated) in &report.populated {
        println!(
            "{res}: {} built, {} replaced, {} deferred, {} failed",
            populated.built, populated.replaced, populated.deferred, populated.failed
        );
    }
    for (res, evicted) in &report.evicted {
        println!(
            "{res}: {} evicted, {} orphans purged, {} busy",
            evicted.deleted, evicted.orphans, evicted.busy
        );
    }
    Ok(())
}

async fn cmd_play(mut cfg: Config, args: PlayArgs) -> anyhow::Result<()> {
    apply_remote(&mut cfg, &args.remote);
    if let Some(w) = args.width {
        cfg.client.width = w;
    }
    if let Some(h) = args.height {
        cfg.client.height = h;
    }

    let mut client = StreamClient::new(cfg.client)?.with_range(args.from, args.to);
    if let Some(name) = args.name {
        client = client.with_asset(name);
    }
    let mut sink = make_sink(args.remote.out)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    match client.run(&mut sink, &cancel).await? {
        StreamOutcome::Completed { name, next_frame } => {
            println!("played '{name}' through frame {}", next_frame.saturating_sub(1));
        }
        StreamOutcome::Cancelled { next_frame } => {
            println!("cancelled before frame {next_frame}");
        }
    }
    Ok(())
}

async fn cmd_clock(mut cfg: Config, args: ClockArgs) -> anyhow::Result<()> {
    apply_remote(&mut cfg, &args.remote);
    let size = cfg.server.clock_size;
    let client = ClockClient::new(cfg.client, args.offset, size)?;
    let mut sink = make_sink(args.remote.out)?;
    let received = client
        .run(&mut sink, args.frames, &CancellationToken::new())
        .await?;
    println!("received {received} clock frames");
    Ok(())
}

fn cmd_status(mut cfg: Config, args: StatusArgs) -> anyhow::Result<()> {
    if let Some(path) = args.catalog {
        cfg.store.catalog_path = path;
    }
    let path = &cfg.store.catalog_path;
    let store = MetadataStore::read_only(path)
        .with_context(|| format!("load catalog '{}'", path.display()))?;
    let mut sessions = store.sessions()?;
    let keep_from = sessions.len().saturating_sub(args.sessions);
    let report = StatusReport {
        assets: store.assets()?,
        caches: store.cache_entries()?,
        sessions: sessions.split_off(keep_from),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
