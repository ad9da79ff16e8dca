//! MarketCache daemon
//!
//! Runs the tiered cache with its maintenance loop, keeps the trading
//! calendar current and exposes health and Prometheus endpoints.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        MarketCache                               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ TieredCache  │◀───│ Maintenance  │    │   Trading    │       │
//! │  │ mem/remote/  │    │  Scheduler   │    │   Calendar   │       │
//! │  │ persistent   │    │              │    │   refresh    │       │
//! │  └──────┬───────┘    └──────────────┘    └──────────────┘       │
//! │         └──────────▶ CacheExporter ──▶ /metrics                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Datelike;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use marketcache::cache::{
    EvictionStrategy, MaintenanceScheduler, PersistentAdapter, RedisConfig, RedisRemoteCache,
    TieredCache,
};
use marketcache::calendar::{HttpCalendarConfig, HttpCalendarSource, TradingCalendar};
use marketcache::{AppConfig, CacheExporter};

// =============================================================================
// CLI Arguments
// =============================================================================

/// MarketCache - tiered market-data cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "MARKETCACHE_CONFIG")]
    config: Option<String>,

    /// Redis URL for the remote tier
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Base URL of the official trading calendar
    #[arg(long, env = "CALENDAR_URL")]
    calendar_url: Option<String>,

    /// Memory tier capacity (entries)
    #[arg(long, env = "MEMORY_CAPACITY")]
    memory_capacity: Option<usize>,

    /// Eviction policy (lru, lfu, adaptive)
    #[arg(long, env = "EVICTION_POLICY")]
    eviction_policy: Option<EvictionStrategy>,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// Load the config file, then apply command-line overrides
    fn resolve(&self) -> anyhow::Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path))?,
            None => AppConfig::default(),
        };

        if let Some(url) = &self.redis_url {
            config.redis = Some(RedisConfig {
                url: url.clone(),
                ..config.redis.unwrap_or_default()
            });
        }
        if let Some(url) = &self.calendar_url {
            config.calendar_source = Some(HttpCalendarConfig {
                base_url: url.clone(),
                timeout_secs: config
                    .calendar_source
                    .as_ref()
                    .map(|c| c.timeout_secs)
                    .unwrap_or(10),
            });
        }
        if let Some(capacity) = self.memory_capacity {
            config.cache.capacity = capacity;
        }
        if let Some(strategy) = self.eviction_policy {
            config.cache.eviction.strategy = strategy;
        }
        if let Some(addr) = &self.metrics_addr {
            config.metrics_addr = addr.clone();
        }
        if let Some(addr) = &self.health_addr {
            config.health_addr = addr.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    let config = args.resolve()?;

    info!("Starting MarketCache {}", marketcache::version());
    info!("  Memory capacity: {}", config.cache.capacity);
    info!("  Eviction policy: {}", config.cache.eviction.strategy);
    info!(
        "  Remote tier: {}",
        config.redis.as_ref().map(|r| r.url.as_str()).unwrap_or("disabled")
    );

    let shutdown = CancellationToken::new();

    // Build the cache tiers
    let mut cache = TieredCache::new(config.cache.clone())
        .with_persistent(Arc::new(PersistentAdapter::in_memory()));

    if let Some(redis) = &config.redis {
        match RedisRemoteCache::connect(redis).await {
            Ok(remote) => cache = cache.with_remote(Arc::new(remote)),
            Err(e) => {
                error!("Redis connection failed: {}", e);
                error!("Continuing without the remote tier");
            }
        }
    }
    let cache = Arc::new(cache);

    // Maintenance loop
    let scheduler = Arc::new(MaintenanceScheduler::new(
        cache.clone(),
        config.maintenance.clone(),
    ));
    let maintenance = scheduler.start(shutdown.clone());

    // Trading calendar refresh
    let mut calendar = TradingCalendar::new(config.calendar.clone())?;
    if let Some(source) = &config.calendar_source {
        calendar = calendar.with_source(Arc::new(HttpCalendarSource::new(source.clone())?));
    }
    let calendar = Arc::new(calendar);
    let refresh_every = Duration::from_secs(config.calendar.refresh_ttl_secs.max(60));
    tokio::spawn(run_calendar_refresh(
        calendar.clone(),
        refresh_every,
        shutdown.clone(),
    ));

    // Start health server
    let health_addr = config.health_addr.clone();
    let health_scheduler = scheduler.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_scheduler).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let exporter = Arc::new(CacheExporter::new()?);
    let metrics_addr = config.metrics_addr.clone();
    let metrics_cache = cache.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_cache, exporter).await {
            error!("Metrics server error: {}", e);
        }
    });

    info!("MarketCache running");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutdown requested");
    shutdown.cancel();
    scheduler.stop();
    if let Err(e) = maintenance.await {
        warn!("Maintenance task ended abnormally: {}", e);
    }
    cache.close();

    info!("MarketCache shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse()?)
        .add_directive("redis=info".parse()?)
        .add_directive("reqwest=warn".parse()?);

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
    Ok(())
}

// =============================================================================
// Calendar Refresh
// =============================================================================

async fn run_calendar_refresh(
    calendar: Arc<TradingCalendar>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let year = calendar.today().year();
                calendar.ensure_fresh([year, year + 1]).await;
            }
        }
    }
}

// =============================================================================
// HTTP Servers
// =============================================================================

type HttpResponse = hyper::Response<http_body_util::Full<hyper::body::Bytes>>;

fn text_response(status: hyper::StatusCode, body: impl Into<hyper::body::Bytes>) -> HttpResponse {
    let mut response = hyper::Response::new(http_body_util::Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn bind(addr: &str, what: &str) -> anyhow::Result<tokio::net::TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid {} server address: {}", what, addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {} server", what))?;
    info!("{} server listening on {}", what, addr);
    Ok(listener)
}

async fn run_health_server(
    addr: &str,
    scheduler: Arc<MaintenanceScheduler>,
) -> anyhow::Result<()> {
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;

    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("Health server accept error")?;

        let io = TokioIo::new(stream);
        let scheduler = scheduler.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let scheduler = scheduler.clone();
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
                        "/readyz" if scheduler.is_running() => text_response(StatusCode::OK, "ok"),
                        "/readyz" => {
                            text_response(StatusCode::SERVICE_UNAVAILABLE, "maintenance stopped")
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

async fn run_metrics_server(
    addr: &str,
    cache: Arc<TieredCache>,
    exporter: Arc<CacheExporter>,
) -> anyhow::Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, StatusCode};
    use hyper_util::rt::TokioIo;

    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("Metrics server accept error")?;

        let io = TokioIo::new(stream);
        let cache = cache.clone();
        let exporter = exporter.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let cache = cache.clone();
                let exporter = exporter.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let queries = cache.persistent().map(|p| p.query_stats());
                            exporter.update(&cache.stats(), queries.as_ref());
                            match exporter.encode() {
                                Ok(body) => {
                                    let mut response = text_response(StatusCode::OK, body);
                                    response.headers_mut().insert(
                                        CONTENT_TYPE,
                                        HeaderValue::from_static(exporter.content_type()),
                                    );
                                    response
                                }
                                Err(e) => text_response(
                                    StatusCode::INTERNAL_SERVER_ERROR,
                                    e.to_string(),
                                ),
                            }
                        }
                        _ => text_response(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
