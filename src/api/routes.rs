//! Router assembly (§6).
//!
//! `/ingest/raw` (POST) is the only route behind the API key layer — every
//! other route is a read or an operator-triggered mutation the ingest key
//! was never meant to gate. Rate limiting and request logging apply to the
//! whole tree, layered on in `main`.

use std::sync::Arc;

use axum::routing::{get, patch, post};
use axum::Router;

use crate::api::state::AppState;
use crate::api::{ingest, insights_api, signals_api, simulation_api};
use crate::middleware::require_api_key;

/// Builds the full application router. `ingest_api_key` is threaded
/// separately from `AppState` because `require_api_key` layers onto only
/// the one route it guards, with its own extractor state.
pub fn build_router(state: AppState) -> Router {
    let ingest_api_key = Arc::new(state.config.ingest_api_key.clone());

    let ingest_write = Router::new()
        .route("/ingest/raw", post(ingest::ingest_raw))
        .layer(axum::middleware::from_fn_with_state(
            ingest_api_key,
            require_api_key,
        ));

    let ingest_read = Router::new().route("/ingest/raw/:leadId", get(ingest::list_raw_ingest));

    let signals = Router::new()
        .route("/signals/heatmap", get(signals_api::heatmap))
        .route("/signals/symbol/:symbol", get(signals_api::symbol_detail))
        .route("/signals/feed", get(signals_api::feed))
        .route("/signals/events", get(signals_api::events_feed))
        .route("/signals/latest-records", get(signals_api::latest_records_feed))
        .route("/signals/trader/:leadId", get(signals_api::trader_metrics))
        .route("/signals/diagnostics/fleet", get(signals_api::diagnostic_fleet))
        .route(
            "/signals/diagnostics/trader/:leadId",
            get(signals_api::diagnostic_trader),
        )
        .route("/signals/insights", get(insights_api::get_insights))
        .route(
            "/signals/insights/rule",
            get(insights_api::get_insights_rule).put(insights_api::put_insights_rule),
        );

    let simulation_signals = Router::new()
        .route("/signals/simulation/open", post(simulation_api::open_position))
        .route(
            "/signals/simulation/:id/close",
            post(simulation_api::close_position),
        )
        .route("/signals/simulation/positions", get(simulation_api::list_positions))
        .route(
            "/signals/simulation/reconcile",
            get(simulation_api::get_reconcile).post(simulation_api::post_reconcile),
        )
        .route("/signals/simulation/report", get(simulation_api::report))
        .route(
            "/signals/simulation/auto-rule",
            get(simulation_api::get_auto_rule).put(simulation_api::put_auto_rule),
        )
        .route("/signals/simulation/auto-run", post(simulation_api::auto_run))
        .route(
            "/signals/simulation/backtest-lite",
            get(simulation_api::backtest_lite),
        );

    let portfolios = Router::new()
        .route(
            "/simulation/portfolios",
            post(simulation_api::create_portfolio).get(simulation_api::list_portfolios),
        )
        .route("/simulation/portfolios/:id", get(simulation_api::get_portfolio))
        .route(
            "/simulation/portfolios/:id/performance",
            get(simulation_api::portfolio_performance),
        );

    let positions = Router::new()
        .route(
            "/simulation/positions/calculate-size",
            post(simulation_api::calculate_size),
        )
        .route(
            "/simulation/positions/open",
            post(simulation_api::open_position_risk_managed),
        )
        .route(
            "/simulation/positions/:id/risk",
            patch(simulation_api::update_position_risk),
        )
        .route(
            "/simulation/positions/monitor",
            post(simulation_api::monitor_positions),
        );

    let backtests = Router::new()
        .route("/simulation/backtests", get(simulation_api::list_backtests))
        .route(
            "/simulation/backtests/:id",
            get(simulation_api::get_backtest).delete(simulation_api::delete_backtest),
        );

    Router::new()
        .route("/health", get(health))
        .merge(ingest_write)
        .merge(ingest_read)
        .merge(signals)
        .merge(simulation_signals)
        .merge(portfolios)
        .merge(positions)
        .merge(backtests)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::storage::Db;

    fn test_state() -> AppState {
        let db = Db::open_in_memory().unwrap();
        let config = Config {
            database_path: ":memory:".to_string(),
            port: 0,
            ingest_api_key: None,
            scrape_concurrency: 1,
            scrape_batch_delay_ms: 0,
            upstream_timeout_secs: 1,
            upstream_base_url: String::new(),
            default_leverage: 10.0,
            default_slippage_bps: 5.0,
            default_commission_bps: 4.0,
            default_min_sample_size: 20,
            rate_limit_max_requests: 100,
            rate_limit_window_secs: 60,
        };
        AppState::new(db, config)
    }

    #[tokio::test]
    async fn health_route_responds() {
        use axum::body::Body;
        use axum::http::Request;
        use tower::ServiceExt;

        let app = build_router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
