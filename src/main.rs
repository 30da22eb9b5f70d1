//! Flashsale Service
//!
//! Runs the cache client and the seckill order pipeline against a Redis
//! store (or an in-process store when no Redis URL is given), with health
//! and Prometheus endpoints, until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Flashsale Service                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ CacheClient  │    │   Seckill    │───▶│    Order     │       │
//! │  │  (rebuild    │    │  admission   │    │   consumer   │       │
//! │  │    pool)     │    │              │    │              │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use http_body_util::Full;
use bytes::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use flashsale::adapters::{
    InMemoryOrderRepository, InMemoryShopRepository, InMemoryStore, LoggingEventPublisher,
    RedisStore,
};
use flashsale::domain::ports::{EventPublisher, KeyValueStore, SeckillVoucher, Shop};
use flashsale::telemetry::ServiceMetrics;
use flashsale::{
    CacheClient, CacheConfig, CacheStrategy, PipelineConfig, SeckillPipeline, ShopService,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Flashsale - cache-aside reads and flash-sale ordering
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis URL; an in-process store is used when absent
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Concurrent background cache rebuilds
    #[arg(long, env = "REBUILD_WORKERS", default_value = "10")]
    rebuild_workers: usize,

    /// Admitted orders held in memory before new admissions are reverted
    #[arg(long, env = "ORDER_QUEUE_CAPACITY", default_value = "1048576")]
    order_queue_capacity: usize,

    /// Per-user order lock TTL in seconds
    #[arg(long, env = "ORDER_LOCK_TTL_SECONDS", default_value = "30")]
    order_lock_ttl_seconds: u64,

    /// Finished orders whose status stays queryable
    #[arg(long, env = "ORDER_STATUS_RETENTION", default_value = "65536")]
    order_status_retention: usize,

    /// Shop rebuild lock TTL in seconds
    #[arg(long, env = "CACHE_LOCK_TTL_SECONDS", default_value = "10")]
    cache_lock_ttl_seconds: u64,

    /// Publish a demo voucher with this much stock and send this many
    /// concurrent buyers at it after startup (0 disables)
    #[arg(long, env = "SIMULATE_BUYERS", default_value = "0")]
    simulate_buyers: u64,

    /// Stock of the demo voucher
    #[arg(long, env = "SIMULATE_STOCK", default_value = "100")]
    simulate_stock: i64,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

/// Everything the HTTP endpoints look at.
#[derive(Clone)]
struct AppState {
    store: Arc<dyn KeyValueStore>,
    cache: CacheClient,
    pipeline: Arc<SeckillPipeline>,
    metrics: Arc<ServiceMetrics>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args)?;

    info!("Starting flashsale service");
    info!("  Rebuild workers: {}", args.rebuild_workers);
    info!("  Order queue capacity: {}", args.order_queue_capacity);
    info!("  Order lock TTL: {}s", args.order_lock_ttl_seconds);

    let store: Arc<dyn KeyValueStore> = match &args.redis_url {
        Some(url) => Arc::new(
            RedisStore::connect(url)
                .await
                .with_context(|| format!("connecting to Redis at {}", url))?,
        ),
        None => {
            warn!("No REDIS_URL given; using an in-process store (state is lost on exit)");
            Arc::new(InMemoryStore::new())
        }
    };
    store.ping().await.context("key-value store did not answer PING")?;
    info!("Key-value store reachable");

    let events: Arc<dyn EventPublisher> = Arc::new(LoggingEventPublisher::info_level());
    let orders = Arc::new(InMemoryOrderRepository::new());
    let shops = Arc::new(InMemoryShopRepository::new());

    let cache = CacheClient::with_config(
        Arc::clone(&store),
        CacheConfig {
            rebuild_workers: args.rebuild_workers,
            lock_ttl: Duration::from_secs(args.cache_lock_ttl_seconds),
            ..CacheConfig::default()
        },
    )
    .with_event_publisher(Arc::clone(&events));

    let pipeline = SeckillPipeline::start(
        Arc::clone(&store),
        orders,
        Arc::clone(&events),
        PipelineConfig {
            queue_capacity: args.order_queue_capacity,
            order_lock_ttl: Duration::from_secs(args.order_lock_ttl_seconds),
            status_retention: args.order_status_retention,
        },
    );

    let state = AppState {
        store: Arc::clone(&store),
        cache: cache.clone(),
        pipeline: Arc::clone(&pipeline),
        metrics: Arc::new(ServiceMetrics::new().context("registering metrics")?),
    };

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_state).await {
            error!("Health server error: {:#}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_state = state.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_state).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    if args.simulate_buyers > 0 {
        let shop_service = ShopService::new(shops.clone(), cache.clone());
        simulate(&args, &pipeline, &shops, &shop_service).await?;
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received; draining order queue");

    pipeline.shutdown().await.context("stopping order pipeline")?;
    cache.shutdown().await;

    info!("Flashsale service shutdown complete");
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
        .add_directive("redis=info".parse()?);

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
// Demo Burst
// =============================================================================

async fn simulate(
    args: &Args,
    pipeline: &Arc<SeckillPipeline>,
    shops: &InMemoryShopRepository,
    shop_service: &ShopService,
) -> anyhow::Result<()> {
    let now = Utc::now();
    let voucher = SeckillVoucher {
        voucher_id: 1,
        stock: args.simulate_stock,
        begin_time: now - chrono::Duration::minutes(1),
        end_time: now + chrono::Duration::hours(1),
    };
    pipeline
        .publish_voucher(&voucher)
        .await
        .context("publishing demo voucher")?;

    shops.insert_shop(Shop {
        id: 1,
        name: "Demo Shop".into(),
        type_id: 1,
        area: "Downtown".into(),
        address: "1 Market St".into(),
        avg_price: 50,
        score: 45,
    });
    shop_service
        .warm_shop(1, Duration::from_secs(30))
        .await
        .context("warming demo shop")?;

    let voucher_id = voucher.voucher_id;
    let mut buyers = tokio::task::JoinSet::new();
    for user_id in 1..=args.simulate_buyers {
        let pipeline = Arc::clone(pipeline);
        buyers.spawn(async move { pipeline.submit(voucher_id, user_id).await });
    }

    let (mut accepted, mut rejected, mut failed) = (0u64, 0u64, 0u64);
    while let Some(joined) = buyers.join_next().await {
        match joined.context("buyer task panicked")? {
            Ok(result) if result.is_accepted() => accepted += 1,
            Ok(_) => rejected += 1,
            Err(e) => {
                warn!("Buyer failed: {}", e);
                failed += 1;
            }
        }
    }

    let shop = shop_service
        .query_by_id(1, CacheStrategy::LogicalExpiry)
        .await
        .context("reading demo shop")?;

    info!(
        accepted,
        rejected,
        failed,
        stock = args.simulate_stock,
        shop_cached = shop.is_some(),
        "Simulated burst finished"
    );
    Ok(())
}

// =============================================================================
// HTTP Helpers
// =============================================================================

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn bind(addr: &str, what: &str) -> anyhow::Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid {} server address {}", what, addr))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {} server", what))?;
    info!("{} server listening on {}", what, addr);
    Ok(listener)
}

// =============================================================================
// Health Server
// =============================================================================

async fn health_handler(
    req: Request<hyper::body::Incoming>,
    state: AppState,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match req.uri().path() {
        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
        "/readyz" => match state.store.ping().await {
            Ok(()) if state.pipeline.is_accepting() => text_response(StatusCode::OK, "ok"),
            Ok(()) => text_response(StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
            Err(e) => text_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("store unreachable: {}", e),
            ),
        },
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn run_health_server(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = bind(addr, "Health").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("health server accept error")?;

        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Health server connection error: {}", e);
            }
        });
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn metrics_handler(
    req: Request<hyper::body::Incoming>,
    state: AppState,
) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            state.metrics.observe(
                &state.cache.metrics(),
                &state.pipeline.metrics(),
                state.pipeline.queue_depth(),
            );
            match state.metrics.render() {
                Ok(buffer) => {
                    let mut response = text_response(StatusCode::OK, buffer);
                    response
                        .headers_mut()
                        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                    response
                }
                Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

async fn run_metrics_server(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = bind(addr, "Metrics").await?;

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("metrics server accept error")?;

        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| metrics_handler(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::error!("Metrics server connection error: {}", e);
            }
        });
    }
}
