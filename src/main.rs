use clap::Parser;
use gigachat_adapter::cache::KvStore;
use gigachat_adapter::config::config_search_paths;
use gigachat_adapter::gigachat::GigaChatClient;
use gigachat_adapter::{build_router, AdapterConfig, AdapterService, AppState, SharedLogger};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "gigachat-adapter",
    about = "OpenAI-compatible API in front of GigaChat",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log file path
    #[arg(long, default_value = "gigachat-adapter.log")]
    log_file: PathBuf,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = AdapterConfig::find_and_load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    let default_filter = if config.debug {
        "gigachat_adapter=debug,tower_http=debug"
    } else {
        "gigachat_adapter=info,tower_http=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let logger = SharedLogger::new(&cli.log_file)?;

    // Fail fast on missing secrets and bad GigaChat credentials
    let bearer_token = config.resolve_bearer_token()?;
    let client = GigaChatClient::new(&config.gigachat, config.resolve_gigachat_secrets())?;
    client.access_token().await?;

    info!("gigachat-adapter v{}", env!("CARGO_PKG_VERSION"));
    info!("  Environment: {}", config.environment);
    info!("  GigaChat:    {}", client.base_url());
    info!("  Cache:       {}", config.cache.path.display());
    info!("  Log file:    {}", cli.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting gigachat-adapter base_url={} bind={}",
            client.base_url(),
            config.bind_addr()
        ),
    );

    let cache = KvStore::open(config.cache.path.clone());
    let service = AdapterService::new(Arc::new(client), cache, logger)
        .with_profanity_check(config.gigachat.profanity_check);

    let state = Arc::new(AppState {
        service: Arc::new(service),
        bearer_token,
        version: env!("CARGO_PKG_VERSION").to_string(),
        cors_allowed_origins: config.cors.allowed_origins.clone(),
    });

    let app = build_router(state);
    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;

    info!("Listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
