use std::{fs, sync::Arc};

use anyhow::{bail, Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use futures::StreamExt;
use rangeloader::{
    config::{validate_config, Config},
    AssetCache, CachingAsset, MemoryCache, RangeEnd, RequestRange, SledCache,
};
use reqwest::Url;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[clap(name = "rangeloader", about = "Cache media byte ranges locally and serve them up fast.")]
enum Rangeloader {
    /// Resolve and print a resource's content information.
    Probe {
        url: Url,

        #[clap(short, long)]
        config_path: Option<Utf8PathBuf>,

        #[clap(flatten)]
        verbose: Verbosity<WarnLevel>,
    },

    /// Fetch a byte range through the cache.
    Fetch {
        url: Url,

        /// First byte offset to fetch.
        #[clap(short, long, default_value = "0")]
        start: u64,

        /// Exclusive end offset; omit to read to the end of the resource.
        #[clap(short, long)]
        end: Option<u64>,

        /// Write the bytes here instead of stdout.
        #[clap(short, long)]
        output: Option<Utf8PathBuf>,

        #[clap(short, long)]
        config_path: Option<Utf8PathBuf>,

        #[clap(flatten)]
        verbose: Verbosity<WarnLevel>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Rangeloader::parse();

    match args {
        Rangeloader::Probe {
            url,
            config_path,
            verbose,
        } => {
            init_tracing(&verbose);
            probe(url, config_path).await?
        }
        Rangeloader::Fetch {
            url,
            start,
            end,
            output,
            config_path,
            verbose,
        } => {
            init_tracing(&verbose);
            fetch(url, start, end, output, config_path).await?
        }
    }

    Ok(())
}

fn init_tracing(verbose: &Verbosity<WarnLevel>) {
    if verbose.log_level().is_some() {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::from_default_env())
            .init();
    }
}

fn load_config(config_path: Option<Utf8PathBuf>) -> Result<Config> {
    let cfg = match config_path {
        Some(path) => {
            let config_data =
                fs::read_to_string(&path).with_context(|| format!("reading config {path}"))?;
            toml::from_str(&config_data)?
        }
        None => Config::default(),
    };

    if !validate_config(&cfg) {
        bail!("Config didn't validate.");
    }

    Ok(cfg)
}

fn open_cache(cfg: &Config) -> Result<Arc<dyn AssetCache>> {
    Ok(match &cfg.caching.db_path {
        Some(db_path) => {
            debug!(%db_path, "using persistent cache");
            Arc::new(SledCache::open(db_path.as_std_path())?)
        }
        None => Arc::new(MemoryCache::new()),
    })
}

async fn probe(url: Url, config_path: Option<Utf8PathBuf>) -> Result<()> {
    let cfg = load_config(config_path)?;
    let cache = open_cache(&cfg)?;

    let asset = CachingAsset::new(url, cache, &cfg.http)?;
    let info = asset
        .submit_metadata_request(asset.new_request_id())
        .await?;

    println!("content-length: {}", info.content_length);
    println!("content-type: {}", info.content_type);
    println!("byte-range-access: {}", info.byte_range_access_supported);

    Ok(())
}

async fn fetch(
    url: Url,
    start: u64,
    end: Option<u64>,
    output: Option<Utf8PathBuf>,
    config_path: Option<Utf8PathBuf>,
) -> Result<()> {
    let cfg = load_config(config_path)?;
    let cache = open_cache(&cfg)?;

    let asset = CachingAsset::new(url, cache, &cfg.http)?;

    let range = RequestRange {
        start,
        end: match end {
            Some(end) => RangeEnd::Exact(end),
            None => RangeEnd::ToEnd,
        },
    };

    let mut stream = asset
        .submit_data_request(asset.new_request_id(), range)
        .await?;

    let mut out: Box<dyn tokio::io::AsyncWrite + Unpin> = match output {
        Some(path) => Box::new(tokio::fs::File::create(path.as_std_path()).await?),
        None => Box::new(tokio::io::stdout()),
    };

    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        total += chunk.len() as u64;
        out.write_all(&chunk).await?;
    }
    out.flush().await?;

    debug!(total, "fetch complete");
    Ok(())
}
