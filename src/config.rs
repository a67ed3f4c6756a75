use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use archiver::Source;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Index, serve and render the r/place history", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Load (or download) the dataset and serve tiles and timelapses over HTTP
    Serve(ServeArgs),
    /// Index local shard files into an archive
    Pack {
        #[command(flatten)]
        source: SourceArgs,
        /// Archive to write, must end in .placed.mla
        #[arg(short, long)]
        out_file: PathBuf,
        /// Shard files, in any order
        #[arg(required = true)]
        shards: Vec<PathBuf>,
    },
    /// Render the final canvas of an archive to a PNG
    Render {
        archive_path: PathBuf,
        out_file: PathBuf,
    },
    /// Render a timelapse of an archive; the format follows the extension (.gif or .apng)
    Timelapse {
        archive_path: PathBuf,
        out_file: PathBuf,
        /// Time covered by each frame
        #[arg(long, default_value = "600")]
        bucket_secs: u64,
    },
}

#[derive(Debug, Args, Clone)]
pub struct SourceArgs {
    /// Which r/place to index (2017 or 2022)
    #[arg(long, env = "PLACED_YEAR", default_value = "2022")]
    pub year: i32,

    /// Shard files are plain CSV even if the published shards are gzipped
    #[arg(long, default_value = "false")]
    pub uncompressed: bool,
}

impl SourceArgs {
    pub fn source(&self) -> anyhow::Result<Source> {
        let source = Source::for_year(self.year)
            .with_context(|| format!("no known data source for year {}", self.year))?;
        Ok(Source {
            gzipped: source.gzipped && !self.uncompressed,
            ..source
        })
    }
}

#[derive(Debug, Args, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// HTTP listen address
    #[arg(long, env = "PLACED_HTTP", default_value = "127.0.0.1:8080")]
    pub http: String,

    /// Where the indexed dataset is cached (defaults to the user cache directory)
    #[arg(long, env = "PLACED_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Ignore the cached dataset and download it again
    #[arg(long, default_value = "false")]
    pub download: bool,

    /// Do not write the downloaded dataset to the cache
    #[arg(long, default_value = "false")]
    pub no_cache_write: bool,

    /// Read shards from local files instead of the published URLs
    #[arg(long = "shard")]
    pub shards: Vec<PathBuf>,

    /// Time covered by each timelapse frame
    #[arg(long, env = "PLACED_TIMELAPSE_BUCKET_SECS", default_value = "600")]
    pub timelapse_bucket_secs: u64,

    /// How long a request waits for data that is still being prepared
    #[arg(long, default_value = "30")]
    pub request_timeout_secs: u64,
}

/// Settings of the `serve` command after defaults are resolved.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: Source,
    pub http: String,
    pub cache_file: PathBuf,
    pub download: bool,
    pub write_cache: bool,
    pub shard_files: Vec<PathBuf>,
    pub server: ServerSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub timelapse_bucket: Duration,
    pub request_timeout: Duration,
    pub status_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            timelapse_bucket: Duration::from_secs(600),
            request_timeout: Duration::from_secs(30),
            status_timeout: Duration::from_secs(1),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|dir| dir.join("placed"))
        .unwrap_or_else(|| PathBuf::from(".placed-cache"))
}

impl Config {
    pub fn from_args(args: ServeArgs) -> anyhow::Result<Self> {
        let source = args.source.source()?;
        let cache_dir = args.cache_dir.unwrap_or_else(default_cache_dir);
        let cache_file = cache_dir.join(format!(
            "place_data_{}{}",
            source.year,
            archive::FILE_SUFFIX
        ));

        Ok(Self {
            source,
            http: args.http,
            cache_file,
            download: args.download,
            write_cache: !args.no_cache_write,
            shard_files: args.shards,
            server: ServerSettings {
                timelapse_bucket: Duration::from_secs(args.timelapse_bucket_secs.max(1)),
                request_timeout: Duration::from_secs(args.request_timeout_secs),
                ..ServerSettings::default()
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn serve_args(args: &[&str]) -> ServeArgs {
        let cli = Cli::try_parse_from(["placed", "serve"].iter().chain(args)).unwrap();
        match cli.command {
            Commands::Serve(args) => args,
            command => panic!("unexpected command {command:?}"),
        }
    }

    #[test]
    fn serve_defaults() {
        let config = Config::from_args(serve_args(&["--year", "2017", "--cache-dir", "/tmp/c"]))
            .unwrap();

        assert_eq!(config.source.canvas_size, 1001);
        assert_eq!(
            config.cache_file,
            PathBuf::from("/tmp/c/place_data_2017.placed.mla")
        );
        assert!(config.write_cache);
        assert!(!config.download);
        assert_eq!(config.server.request_timeout, Duration::from_secs(30));
        assert_eq!(config.server.status_timeout, Duration::from_secs(1));
    }

    #[test]
    fn unknown_year_is_an_error() {
        let err = Config::from_args(serve_args(&["--year", "2019"])).unwrap_err();
        assert_eq!(err.to_string(), "no known data source for year 2019");
    }

    #[test]
    fn uncompressed_overrides_source() {
        let args = serve_args(&["--year", "2022", "--uncompressed", "--shard", "a.csv"]);
        let config = Config::from_args(args).unwrap();
        assert!(!config.source.gzipped);
        assert_eq!(config.shard_files, vec![PathBuf::from("a.csv")]);
    }

    #[test]
    fn pack_requires_shards() {
        assert!(Cli::try_parse_from(["placed", "pack", "-o", "out.placed.mla"]).is_err());
        assert!(Cli::try_parse_from(["placed", "pack", "-o", "out.placed.mla", "a.csv.gz"]).is_ok());
    }
}
