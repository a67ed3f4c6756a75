use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use archiver::{FileShard, ShardSource};
use structures::Dataset;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;

/// Produces the dataset for this run: the cached archive when it is usable,
/// otherwise a fresh ingestion that is then cached in the background.
pub async fn load_or_ingest(
    config: &Config,
    cancel: &CancellationToken,
) -> anyhow::Result<Arc<Dataset>> {
    if config.download {
        info!("Download requested, ignoring any cached dataset");
    } else if let Some(dataset) = load_cached(config).await? {
        return Ok(Arc::new(dataset));
    }

    let shards: Vec<Box<dyn ShardSource>> = if config.shard_files.is_empty() {
        config.source.default_shards()
    } else {
        config
            .shard_files
            .iter()
            .map(|path| Box::new(FileShard::new(path)) as Box<dyn ShardSource>)
            .collect()
    };
    info!(
        year = config.source.year,
        shards = shards.len(),
        "Downloading dataset"
    );

    let dataset = archiver::ingest(&config.source, shards, cancel)
        .await
        .context("failed to download dataset")?;
    let dataset = Arc::new(dataset);

    if config.write_cache {
        spawn_save(config.cache_file.clone(), dataset.clone());
    }
    Ok(dataset)
}

async fn load_cached(config: &Config) -> anyhow::Result<Option<Dataset>> {
    let path = config.cache_file.clone();
    match tokio::fs::try_exists(&path).await {
        Ok(true) => {}
        Ok(false) => {
            info!(path = %path.display(), "No cached dataset found");
            return Ok(None);
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "Failed to check cache, downloading again");
            return Ok(None);
        }
    }

    info!(path = %path.display(), "Loading cached dataset (--download to re-download)");
    let loaded = tokio::task::spawn_blocking(move || archive::load(&path))
        .await
        .context("dataset loader did not finish")?;

    match loaded {
        Ok(dataset) if dataset.width == config.source.canvas_size => Ok(Some(dataset)),
        Ok(dataset) => {
            warn!(
                width = dataset.width,
                expected = config.source.canvas_size,
                "Cached dataset is for a different canvas, downloading again"
            );
            Ok(None)
        }
        Err(err) => {
            warn!(error = %err, "Could not load cached dataset, downloading again");
            Ok(None)
        }
    }
}

/// Writes the dataset to the cache without blocking startup. Failures are
/// logged and otherwise ignored.
pub fn spawn_save(path: PathBuf, dataset: Arc<Dataset>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        if let Some(parent) = path.parent() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                warn!(path = %parent.display(), error = %err, "Failed to create cache directory");
                return;
            }
        }
        if let Err(err) = archive::save_to(&path, &dataset) {
            warn!(path = %path.display(), error = %err, "Failed to cache dataset to file");
        }
    })
}
