mod config;
mod downloader;
mod errors;
mod fetch;
mod metadata;
mod server;
mod token;
mod utils;

use clap::Parser;
use config::AppConfig;
use downloader::cobalt::CobaltSource;
use downloader::ytdlp::YtDlpSource;
use downloader::DownloadController;
use errors::{AppError, Result};
use fetch::FetchClient;
use metadata::tagging::{HelperTagger, NoopTagger, Tagger};
use metadata::Enricher;
use server::AppState;
use std::path::PathBuf;
use std::sync::Arc;
use token::{HttpTokenGenerator, TokenCache, TokenGenerator, TokenPayload};

#[derive(Parser)]
#[command(name = "tunegrab", about = "Audio fetch service with live progress")]
struct Cli {
    /// Path to the config file (defaults to the platform config dir).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

/// Stands in when no token service is configured; the fallback
/// extractor then runs without a session token.
struct DisabledTokenGenerator;

#[async_trait::async_trait]
impl TokenGenerator for DisabledTokenGenerator {
    async fn generate(&self) -> Result<TokenPayload> {
        Err(AppError::Config("no token service configured".to_string()))
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        log::error!("❌ [MAIN] {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    let config = Arc::new(config);

    utils::ensure_dir_exists(&config.work_dir).await?;

    let fetcher = Arc::new(FetchClient::new(&config.fetch)?);

    let generator: Arc<dyn TokenGenerator> = match &config.token_service_url {
        Some(url) => Arc::new(HttpTokenGenerator::new(url.clone())),
        None => {
            log::info!("[MAIN] no token service configured, extractor runs without tokens");
            Arc::new(DisabledTokenGenerator)
        }
    };
    let token_cache = Arc::new(TokenCache::new(generator));

    let tagger: Arc<dyn Tagger> = match &config.tagger_bin {
        Some(bin) => Arc::new(HelperTagger::new(bin.clone())),
        None => Arc::new(NoopTagger),
    };

    let controller = Arc::new(DownloadController::new(
        Arc::new(CobaltSource::new(config.clone(), fetcher)?),
        Arc::new(YtDlpSource::new(config.clone(), token_cache.clone())),
        Arc::new(Enricher::new()),
        tagger,
    ));

    let state = AppState {
        config: config.clone(),
        controller,
        token_cache,
    };

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::Config(format!("could not bind {}: {}", addr, e)))?;

    log::info!("🚀 [MAIN] listening on http://{}", addr);
    axum::serve(listener, server::router(state))
        .await
        .map_err(AppError::Io)?;

    Ok(())
}
