use std::{ffi::OsStr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use archiver::{FileShard, ShardSource};
use clap::Parser;
use render::{AnimationFormat, TileSnapshot, Timelapse};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Cli, Commands, Config, SourceArgs};

mod config;
mod loader;
mod server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => serve(Config::from_args(args)?).await,
        Commands::Pack {
            source,
            out_file,
            shards,
        } => pack(source, out_file, shards).await,
        Commands::Render {
            archive_path,
            out_file,
        } => tokio::task::spawn_blocking(move || render_snapshot(archive_path, out_file)).await?,
        Commands::Timelapse {
            archive_path,
            out_file,
            bucket_secs,
        } => {
            let bucket = Duration::from_secs(bucket_secs.max(1));
            tokio::task::spawn_blocking(move || render_timelapse(archive_path, out_file, bucket))
                .await?
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let (resolver, dataset) = completion::pending();
    let state = Arc::new(server::AppState::new(dataset, config.server.clone()));

    let listener = TcpListener::bind(&config.http)
        .await
        .with_context(|| format!("failed to listen on {:?}", config.http))?;
    info!(addr = %listener.local_addr()?, "Serving HTTP");

    let loader = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match loader::load_or_ingest(&config, &cancel).await {
                Ok(dataset) => {
                    info!(
                        events = dataset.num_events(),
                        users = dataset.user_ids.len(),
                        start = %dataset.start(),
                        end = %dataset.end(),
                        "Dataset ready"
                    );
                    resolver.provide(Ok(dataset));
                    Ok(())
                }
                Err(_) if cancel.is_cancelled() => Ok(()),
                Err(err) => {
                    error!(error = %format!("{err:#}"), "Failed to initialize dataset");
                    resolver.provide(Err(anyhow::anyhow!("{err:#}")));
                    // Nothing useful can be served without the dataset
                    cancel.cancel();
                    Err(err)
                }
            }
        })
    };

    let shutdown = cancel.clone();
    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
                _ = shutdown.cancelled() => {}
            }
        })
        .await
        .context("HTTP server failed")?;

    cancel.cancel();
    loader.await?
}

async fn pack(source: SourceArgs, out_file: PathBuf, shards: Vec<PathBuf>) -> anyhow::Result<()> {
    let source = source.source()?;
    let shards: Vec<Box<dyn ShardSource>> = shards
        .into_iter()
        .map(|path| Box::new(FileShard::new(path)) as Box<dyn ShardSource>)
        .collect();

    // Dropping the ingestion future stops every shard reader
    let cancel = CancellationToken::new();
    let dataset = tokio::select! {
        result = archiver::ingest(&source, shards, &cancel) => {
            result.context("failed to index shards")?
        }
        _ = tokio::signal::ctrl_c() => anyhow::bail!("interrupted"),
    };

    tokio::task::spawn_blocking(move || archive::save_to(&out_file, &dataset))
        .await?
        .context("failed to write archive")
}

fn render_snapshot(archive_path: PathBuf, out_file: PathBuf) -> anyhow::Result<()> {
    let dataset = archive::load(&archive_path)
        .with_context(|| format!("failed to load {}", archive_path.display()))?;

    let png = render::encode_png(&TileSnapshot::build(&dataset))?;
    std::fs::write(&out_file, &png)
        .with_context(|| format!("failed to write {}", out_file.display()))?;

    info!(path = %out_file.display(), bytes = png.len(), "Wrote snapshot");
    Ok(())
}

fn render_timelapse(
    archive_path: PathBuf,
    out_file: PathBuf,
    bucket: Duration,
) -> anyhow::Result<()> {
    let format = out_file
        .extension()
        .and_then(OsStr::to_str)
        .and_then(AnimationFormat::from_extension)
        .with_context(|| {
            format!(
                "cannot tell the animation format of {}, use .gif or .apng",
                out_file.display()
            )
        })?;

    let dataset = archive::load(&archive_path)
        .with_context(|| format!("failed to load {}", archive_path.display()))?;

    let timelapse = Timelapse::render(&dataset, bucket);
    info!(frames = timelapse.len(), "Rendered frames");

    let data = timelapse.encode(format)?;
    std::fs::write(&out_file, &data)
        .with_context(|| format!("failed to write {}", out_file.display()))?;

    info!(path = %out_file.display(), bytes = data.len(), "Wrote timelapse");
    Ok(())
}
