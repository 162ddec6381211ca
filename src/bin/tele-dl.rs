use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tele_dl::{
    Admission, AppConfig, BatchRef, ChannelId, DownloadManager, HttpTransport, KeepInPlace,
    LogSink, ShutdownMode, SourceHandle, Submission, TransportSet,
};

/// Messages from the command line all go to one log channel.
const CLI_CHANNEL: ChannelId = ChannelId(0);

fn print_usage() {
    eprintln!("Usage: tele-dl [OPTIONS] <url>...");
    eprintln!();
    eprintln!("Options:");
    eprintln!(
        "  -c, --config <FILE>  Configuration file (default: {})",
        AppConfig::default_path().display()
    );
    eprintln!("  -b, --batch          Treat all URLs as one batch");
    eprintln!("  -h, --help           Show this help");
    eprintln!();
    eprintln!("Set RUST_LOG to change log verbosity (default: info).");
}

struct Args {
    config: PathBuf,
    batch: bool,
    urls: Vec<String>,
}

fn parse_args() -> Args {
    let mut config = AppConfig::default_path();
    let mut batch = false;
    let mut urls = Vec::new();

    let args: Vec<String> = env::args().skip(1).collect();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                i += 1;
                if i < args.len() {
                    config = PathBuf::from(&args[i]);
                } else {
                    eprintln!("Error: --config requires a value");
                    std::process::exit(1);
                }
            }
            "-b" | "--batch" => batch = true,
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            other if other.starts_with('-') => {
                eprintln!("Error: unknown option {other}");
                print_usage();
                std::process::exit(1);
            }
            url => urls.push(url.to_string()),
        }
        i += 1;
    }

    Args { config, batch, urls }
}

/// Builds a configured HTTP client for downloads.
fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30))
        .build()
}

/// Last path segment of `url`, or a numbered fallback.
fn file_name_for(url: &str, index: usize) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let path = path.split_once("://").map_or(path, |(_, rest)| rest);
    path.split_once('/')
        .and_then(|(_, tail)| tail.rsplit('/').next())
        .filter(|name| !name.is_empty())
        .map_or_else(|| format!("download-{}", index + 1), str::to_string)
}

/// Announced size of `url`, or 0 if the server does not say.
async fn remote_size(client: &reqwest::Client, url: &str) -> u64 {
    match client.head(url).send().await {
        Ok(response) if response.status().is_success() => response.content_length().unwrap_or(0),
        Ok(response) => {
            log::debug!("HEAD {url} returned {}", response.status());
            0
        }
        Err(e) => {
            log::debug!("HEAD {url} failed: {e}");
            0
        }
    }
}

#[tokio::main]
async fn main() -> tele_dl::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args();
    if args.urls.is_empty() {
        print_usage();
        std::process::exit(1);
    }

    let config = AppConfig::load(&args.config)?;
    log::info!("Download directory: {}", config.paths.download_dir.display());

    let http = build_http_client()?;
    let chunk_size = config.download.chunk_size;
    let simple = HttpTransport::simple(http.clone()).with_chunk_size(chunk_size);
    let mut transports = TransportSet::new(Arc::new(simple));
    if config.download.resume_support {
        let resumable = HttpTransport::resumable(http.clone()).with_chunk_size(chunk_size);
        transports = transports.with_bulk(Arc::new(resumable));
    }

    let sink = Arc::new(LogSink::new());
    let manager = DownloadManager::builder(config.download.clone(), transports, sink)
        .stats_file(config.paths.stats_file.clone())
        .categorizer(Arc::new(KeepInPlace))
        .start()
        .await;

    let batch = args.batch.then(|| {
        let id = uuid::Uuid::new_v4().simple().to_string();
        BatchRef::new(format!("CLI-{}", &id[..8]), args.urls.len())
    });

    for (index, url) in args.urls.iter().enumerate() {
        let name = file_name_for(url, index);
        let source = SourceHandle::new(url.clone(), name.clone()).with_rich(url.clone());
        let destination = config.paths.download_dir.join(&name);
        let mut submission = Submission::new(source, destination, CLI_CHANNEL)
            .with_expected_size(remote_size(&http, url).await);
        if let Some(batch) = &batch {
            submission = submission.in_batch(batch.clone());
        }

        match manager.enqueue(submission).await {
            Ok(Admission::Queued { position, .. }) => {
                log::info!("Queued {name} at position {position}");
            }
            Ok(Admission::Duplicate) => log::warn!("Skipping duplicate {url}"),
            Err(e) => log::error!("Could not queue {url}: {e}"),
        }
    }

    tokio::select! {
        () = manager.wait_idle() => {
            manager.shutdown(ShutdownMode::Graceful).await?;
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            log::warn!("Interrupted, aborting running downloads");
            manager.shutdown(ShutdownMode::Abort).await?;
        }
    }

    println!("{}", manager.stats_report());
    if let Some(reason) = manager.fatal_error() {
        eprintln!("Stopped early: {reason}");
        std::process::exit(1);
    }
    Ok(())
}
