//! Application configuration, loaded from the environment.
//!
//! Follows the same `from_env` shape the rest of this family of services
//! uses: a `.env` file is loaded first (best-effort), then each knob is
//! read with a documented default so the service boots without any
//! environment at all (pointing at a local sqlite file on an arbitrary
//! port).

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    pub ingest_api_key: Option<String>,

    /// §4.2 scraper orchestrator
    pub scrape_concurrency: usize,
    pub scrape_batch_delay_ms: u64,
    /// §4.1 per-sub-request timeout
    pub upstream_timeout_secs: u64,
    pub upstream_base_url: String,

    /// §6 default knobs for simulation/auto-trigger
    pub default_leverage: f64,
    pub default_slippage_bps: f64,
    pub default_commission_bps: f64,
    pub default_min_sample_size: usize,

    pub rate_limit_max_requests: u32,
    pub rate_limit_window_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./copytrade.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let ingest_api_key = std::env::var("INGEST_API_KEY").ok();

        let scrape_concurrency = std::env::var("SCRAPE_CONCURRENCY")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&v: &usize| v > 0)
            .unwrap_or(5);

        let scrape_batch_delay_ms = std::env::var("SCRAPE_BATCH_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500);

        let upstream_timeout_secs = std::env::var("UPSTREAM_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(15);

        let upstream_base_url = std::env::var("UPSTREAM_BASE_URL")
            .unwrap_or_else(|_| "https://www.binance.com/bapi/futures/v1".to_string());

        let default_leverage = std::env::var("DEFAULT_LEVERAGE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10.0);

        let default_slippage_bps = std::env::var("DEFAULT_SLIPPAGE_BPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5.0);

        let default_commission_bps = std::env::var("DEFAULT_COMMISSION_BPS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(4.0);

        let default_min_sample_size = std::env::var("DEFAULT_MIN_SAMPLE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(20);

        let rate_limit_max_requests = std::env::var("RATE_LIMIT_MAX_REQUESTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(120);

        let rate_limit_window_secs = std::env::var("RATE_LIMIT_WINDOW_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(60);

        Ok(Self {
            database_path,
            port,
            ingest_api_key,
            scrape_concurrency,
            scrape_batch_delay_ms,
            upstream_timeout_secs,
            upstream_base_url,
            default_leverage,
            default_slippage_bps,
            default_commission_bps,
            default_min_sample_size,
            rate_limit_max_requests,
            rate_limit_window_secs,
        })
    }
}
