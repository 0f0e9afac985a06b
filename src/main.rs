use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use slide_kiosk::bundle::{BundleCache, HttpFetcher};
use slide_kiosk::config::Configuration;
use slide_kiosk::content::BundleContentLoader;
use slide_kiosk::events::{CurrentSlideChanged, ShowCommand};
use slide_kiosk::registry::SlideRegistry;
use slide_kiosk::renderer::HeadlessRenderer;
use slide_kiosk::tasks::{control, show};
use slide_kiosk::SlideLifecycleManager;

#[derive(Debug, Parser)]
#[command(name = "slide-kiosk", version, about = "remotely managed slide show")]
struct Args {
    /// Path to YAML config
    #[arg(value_name = "CONFIG")]
    config: PathBuf,
    /// Deterministic RNG seed for random and weighted playlist items
    #[arg(long = "playlist-seed", value_name = "SEED")]
    playlist_seed: Option<u64>,
    /// Increase log detail for this crate (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Args {
        config,
        playlist_seed,
        verbose,
    } = Args::parse();

    // init tracing (RUST_LOG controls level, default = info)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let filter = match verbose {
        0 => filter,
        1 => filter.add_directive("slide_kiosk=debug".parse()?),
        _ => filter.add_directive("slide_kiosk=trace".parse()?),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut cfg = Configuration::from_yaml_file(&config)
        .with_context(|| format!("failed to load configuration from {}", config.display()))?
        .validated()
        .context("invalid configuration values")?;
    if playlist_seed.is_some() {
        cfg.playlist_seed = playlist_seed;
    }
    tracing::info!(
        config = %config.display(),
        cache = %cfg.cache_dir.display(),
        transition = %humantime::format_duration(cfg.transition_duration),
        "configuration loaded"
    );
    tracing::debug!("{cfg:#?}");

    tokio::fs::create_dir_all(&cfg.cache_dir)
        .await
        .with_context(|| format!("failed to create cache dir {}", cfg.cache_dir.display()))?;

    let fetcher = HttpFetcher::new(cfg.fetch_timeout).context("failed to build http client")?;
    let cache = Arc::new(BundleCache::new(cfg.cache_dir.clone(), Arc::new(fetcher)));
    let registry = SlideRegistry::new();

    // Channels (small/bounded)
    let (show_tx, show_rx) = mpsc::channel::<ShowCommand>(64); // Manager -> Show
    let (events_tx, _) = broadcast::channel::<CurrentSlideChanged>(64); // Show -> subscribers

    let manager = SlideLifecycleManager::new(
        registry.clone(),
        cache,
        Arc::new(BundleContentLoader::new()),
        show_tx,
        events_tx.clone(),
        cfg.lock_retry,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("ctrl-c handler failed: {err}");
                return;
            }
            tracing::info!("ctrl-c received; initiating shutdown");
            cancel.cancel();
        });
    }

    let mut tasks = JoinSet::new();

    // Show loop
    tasks.spawn({
        let options = show::ShowOptions {
            auto_advance: cfg.auto_advance,
            hook_loop_interval: cfg.hook_loop_interval,
            playlist: cfg.playlist.clone(),
            seed: cfg.playlist_seed,
        };
        let renderer = HeadlessRenderer::new(cfg.transition_duration);
        let cancel = cancel.clone();
        async move {
            show::run(options, registry, renderer, show_rx, events_tx, cancel)
                .await
                .context("show task failed")
        }
    });

    // Control socket
    tasks.spawn({
        let socket = cfg.control_socket_path.clone();
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move {
            control::run(socket, manager, cancel)
                .await
                .context("control task failed")
        }
    });

    if cfg.restore_cached {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager.restore_cached().await;
        });
    }

    // Any task ending stops the rest.
    while let Some(res) = tasks.join_next().await {
        cancel.cancel();
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("task error: {e:?}"),
            Err(e) => tracing::error!("join error: {e}"),
        }
    }

    Ok(())
}
