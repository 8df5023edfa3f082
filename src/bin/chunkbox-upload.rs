//! Upload a file to a chunkbox server, resuming whatever a previous attempt
//! left behind.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chunkbox::config::ClientConfig;
use chunkbox::transport::HttpTransport;
use chunkbox::uploader::{UploadEvent, UploadSource, Uploader, UploaderOptions};

#[derive(Debug, Parser)]
#[command(name = "chunkbox-upload", version, about = "Resumable chunked upload client")]
struct Args {
    /// File to upload
    file: PathBuf,

    /// Upload api base url
    #[arg(long, env = "CHUNKBOX_SERVER")]
    server: Option<String>,

    /// Api key sent as X-API-Key
    #[arg(long, env = "CHUNKBOX_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Chunk size in bytes
    #[arg(long)]
    chunk_size: Option<u64>,

    /// Maximum concurrent chunk uploads
    #[arg(long)]
    concurrency: Option<usize>,

    /// Precomputed file fingerprint (skips hashing)
    #[arg(long)]
    fingerprint: Option<String>,

    /// Do not send per-chunk hashes
    #[arg(long)]
    no_chunk_hash: bool,
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::from_env();
        if let Some(server) = &self.server {
            let api_key = config.api_key.take();
            let (chunk_size, concurrency, chunk_hash) = (config.chunk_size, config.concurrency, config.chunk_hash);
            config = ClientConfig::for_server(server);
            config.api_key = api_key;
            config.chunk_size = chunk_size;
            config.concurrency = concurrency;
            config.chunk_hash = chunk_hash;
        }
        if let Some(key) = &self.api_key {
            config.api_key = Some(key.clone());
        }
        if let Some(size) = self.chunk_size {
            config.chunk_size = size.max(1);
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n.max(1);
        }
        if self.no_chunk_hash {
            config.chunk_hash = false;
        }
        config
    }
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let config = args.client_config();

    let source = match UploadSource::from_path(&args.file).await {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Cannot read {}: {}", args.file.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let transport = match HttpTransport::new(&config) {
        Ok(transport) => Arc::new(transport),
        Err(e) => {
            eprintln!("Cannot build HTTP client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let mut uploader = Uploader::new(source, transport, UploaderOptions::from(&config)).with_events(events_tx);
    if let Some(fingerprint) = &args.fingerprint {
        uploader = uploader.with_fingerprint(fingerprint.clone());
    }

    let bar = progress_bar();
    let reporter = {
        let bar = bar.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    UploadEvent::Hashing { percent } => {
                        bar.set_message("fingerprinting");
                        bar.set_position(percent as u64);
                    }
                    UploadEvent::StateChanged(state) => bar.set_message(format!("{:?}", state).to_lowercase()),
                    UploadEvent::Progress { percent, uploaded, total } => {
                        bar.set_position(percent as u64);
                        bar.set_message(format!("{}/{} chunks", uploaded, total));
                    }
                    UploadEvent::ChunkFailed { index, error } => {
                        bar.println(format!("chunk {} failed: {}", index, error));
                    }
                    UploadEvent::Completed(_) | UploadEvent::Failed(_) => {}
                }
            }
        })
    };

    // ctrl-c cancels the session; stored chunks stay on the server for next time
    let canceller = uploader.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            canceller.cancel();
        }
    });

    let result = uploader.start().await;
    ctrl_c.abort();
    drop(uploader);
    let _ = reporter.await;

    match result {
        Ok(outcome) => {
            let how = if outcome.instant { "already on server" } else { "uploaded" };
            bar.finish_with_message(how);
            println!("{}", outcome.artifact_ref);
            ExitCode::SUCCESS
        }
        Err(e) => {
            bar.abandon_with_message("failed");
            eprintln!("Upload failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
