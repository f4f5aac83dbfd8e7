//! Binary entrypoint: wires config, storage, the HTTP API, and the
//! background scrape loop together (§6, §4.2).

use std::net::SocketAddr;
use std::time::Duration;

use copytrade_consensus::api::{build_router, AppState};
use copytrade_consensus::config::Config;
use copytrade_consensus::derive::run_derivation_sweep;
use copytrade_consensus::middleware::rate_limit::rate_limit_middleware;
use copytrade_consensus::middleware::{request_logging, RateLimitConfig, RateLimitLayer};
use copytrade_consensus::scraper::{ScrapeOutcome, ScraperOrchestrator};
use copytrade_consensus::storage::Db;
use copytrade_consensus::upstream::{UpstreamClient, UpstreamPayload};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "copytrade_consensus=info,tower_http=info".into()))
        .with(fmt::layer())
        .init();
}

/// Converts one scraped payload into the camelCase envelope
/// `insert_raw_ingest`/`run_derivation_pass` expect — the same shape an
/// external pusher sends to `POST /ingest/raw` (§4.1, §4.3).
fn payload_to_ingest_json(payload: &UpstreamPayload) -> serde_json::Value {
    let order_history = payload.order_history.as_ref().map(|block| {
        serde_json::json!({
            "total": block.total,
            "allOrders": block.all_orders,
        })
    });

    serde_json::json!({
        "fetchedAt": payload.fetched_at.to_rfc3339(),
        "timeRange": payload.time_range,
        "startTime": payload.start_time.to_rfc3339(),
        "endTime": payload.end_time.to_rfc3339(),
        "leadCommon": payload.lead_common,
        "portfolioDetail": payload.portfolio_detail,
        "activePositions": payload.active_positions,
        "positionAudit": payload.position_audit.as_ref().map(|audit| serde_json::json!({
            "totalCount": audit.total_count,
            "nonZeroAmountCount": audit.non_zero_amount_count,
            "nonZeroNotionalCount": audit.non_zero_notional_count,
            "filteredActivePositionsCount": audit.filtered_active_positions_count,
        })),
        "roiSeries": payload.roi_series,
        "assetPreferences": payload.asset_preferences,
        "orderHistory": order_history,
    })
}

/// Re-scrapes every trader already on file, stores each fresh snapshot,
/// and runs a derivation sweep over the result (§4.2, §7). Traders only
/// enter this universe through `POST /ingest/raw`; this loop keeps their
/// history current without a caller pushing every cycle.
async fn run_scrape_cycle(db: &Db, orchestrator: &ScraperOrchestrator) {
    let trader_ids = match db.list_trader_ids() {
        Ok(ids) => ids,
        Err(err) => {
            error!(error = %err, "failed to list trader ids for scrape cycle");
            return;
        }
    };
    if trader_ids.is_empty() {
        return;
    }

    let outcomes = orchestrator.scrape_all(&trader_ids).await;
    let mut stored = 0u32;
    for outcome in outcomes {
        match outcome {
            ScrapeOutcome::Ok { trader_id, payload } => {
                let ingest_json = payload_to_ingest_json(&payload);
                if let Err(err) = db.insert_raw_ingest(&trader_id, &ingest_json) {
                    warn!(trader_id, error = %err, "failed to store scraped snapshot");
                    continue;
                }
                stored += 1;
            }
            ScrapeOutcome::Err { trader_id, error } => {
                warn!(trader_id, error, "scrape failed for trader");
            }
        }
    }

    info!(stored, total = trader_ids.len(), "scrape cycle stored snapshots");

    match run_derivation_sweep(db) {
        Ok(scores) => info!(scored = scores.len(), "derivation sweep complete"),
        Err(err) => error!(error = %err, "derivation sweep failed"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    let db = Db::open(&config.database_path)?;
    let state = AppState::new(db.clone(), config.clone());

    let client = UpstreamClient::new(config.upstream_base_url.clone(), config.upstream_timeout_secs);
    let orchestrator = ScraperOrchestrator::new(
        client,
        config.scrape_concurrency,
        config.scrape_batch_delay_ms,
    );

    let scrape_db = db.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            run_scrape_cycle(&scrape_db, &orchestrator).await;
        }
    });

    let rate_limiter = RateLimitLayer::new(RateLimitConfig {
        max_requests: config.rate_limit_max_requests,
        window: Duration::from_secs(config.rate_limit_window_secs),
        ..RateLimitConfig::default()
    });
    tokio::spawn({
        let rate_limiter = rate_limiter.clone();
        async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                rate_limiter.cleanup();
            }
        }
    });

    let app = build_router(state)
        .layer(axum::middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ))
        .layer(axum::middleware::from_fn(request_logging))
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "copytrade-consensus listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
