//! Server binary for plainpaper.
//!
//! A thin shim over the library: reads `PLAINPAPER_*` configuration, applies
//! CLI overrides, assembles the service and serves the HTTP router until
//! Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use plainpaper::prompts::Lang;
use plainpaper::{http, DocumentService, ServiceConfig};
use std::io;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

const AFTER_HELP: &str = r#"ENVIRONMENT:
  PLAINPAPER_SESSION_SECRET     HMAC secret for session tokens (random per process if unset)
  PLAINPAPER_SESSION_TTL_SECS   Session token lifetime (default 300)
  PLAINPAPER_CAPTURE_TTL_SECS   Capture lifetime (default 600)
  PLAINPAPER_MAX_CAPTURES       In-memory store entry cap (default 80)
  PLAINPAPER_MAX_STORE_BYTES    In-memory store byte cap (default 120 MiB)
  PLAINPAPER_MAX_IMAGE_BYTES    Per-image decoded size cap (default 8 MiB)
  PLAINPAPER_RATE_LIMIT_MAX     Requests per window per route and caller (default 5)
  PLAINPAPER_RATE_LIMIT_WINDOW_SECS  Window length (default 60)
  OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY  Provider credentials

EXAMPLES:
  # Local development (loopback origins only, in-memory store)
  OPENAI_API_KEY=sk-... plainpaper

  # Production behind a proxy, shared Redis
  plainpaper --bind 0.0.0.0:8080 \
    --allowed-origin https://plainpaper.example \
    --redis-url redis://redis:6379/0
"#;

/// Serve the plainpaper document-explanation API.
#[derive(Parser, Debug)]
#[command(
    name = "plainpaper",
    version,
    about = "Serve the plainpaper document-explanation API",
    long_about = "Explain photographed bureaucratic documents in plain language. Serves the \
capture, OCR, analyze and Q&A routes, streaming variants included, backed by any Vision LLM \
provider edgequake-llm supports (OpenAI, Anthropic, Gemini, Azure, Ollama, ...).",
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Address to bind the HTTP server to (host:port).
    #[arg(long, env = "PLAINPAPER_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Exact origin browsers must send. Unset: loopback origins only.
    #[arg(long, env = "PLAINPAPER_ALLOWED_ORIGIN")]
    allowed_origin: Option<String>,

    /// Redis URL for the shared capture store, rate limits and metrics.
    #[arg(long, env = "PLAINPAPER_REDIS_URL")]
    redis_url: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "PLAINPAPER_PROVIDER")]
    provider: Option<String>,

    /// Vision model ID (default gpt-4.1-mini).
    #[arg(long, env = "PLAINPAPER_MODEL")]
    model: Option<String>,

    /// Language used when a request names none: es or en.
    #[arg(long, env = "PLAINPAPER_LANG", value_parser = parse_lang)]
    lang: Option<Lang>,

    /// Debug-level logging.
    #[arg(short, long, env = "PLAINPAPER_VERBOSE")]
    verbose: bool,

    /// Errors only.
    #[arg(short, long, env = "PLAINPAPER_QUIET", conflicts_with = "verbose")]
    quiet: bool,
}

fn parse_lang(tag: &str) -> Result<Lang, String> {
    Lang::parse(tag).ok_or_else(|| format!("unsupported language '{tag}' (expected es or en)"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "plainpaper=debug,info"
    } else if cli.quiet {
        "error"
    } else {
        "plainpaper=info,warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let mut builder = ServiceConfig::from_env()
        .context("Invalid PLAINPAPER_* configuration")?
        .into_builder();
    if let Some(origin) = cli.allowed_origin {
        builder = builder.allowed_origin(origin);
    }
    if let Some(url) = cli.redis_url {
        builder = builder.redis_url(url);
    }
    if let Some(provider) = cli.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(lang) = cli.lang {
        builder = builder.default_lang(lang);
    }
    let config = builder.build().context("Invalid configuration")?;

    let service = DocumentService::builder(config)
        .build()
        .context("Failed to assemble the service")?;
    let app = http::router(service);

    let addr: SocketAddr = cli
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cli.bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("plainpaper listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;
    info!("plainpaper stopped");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler available: run until killed.
        std::future::pending::<()>().await;
    }
}
