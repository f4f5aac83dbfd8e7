//! Schema for the sqlite-backed stores (§4.3-§4.14).

pub const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS raw_ingest (
    trader_id TEXT NOT NULL,
    fetched_at TEXT NOT NULL,
    positions_count INTEGER NOT NULL,
    orders_count INTEGER NOT NULL,
    time_range TEXT,
    payload_json TEXT NOT NULL,
    parity_ok INTEGER,
    PRIMARY KEY (trader_id, fetched_at)
);

CREATE INDEX IF NOT EXISTS idx_raw_ingest_trader_fetched
    ON raw_ingest(trader_id, fetched_at DESC);

CREATE TABLE IF NOT EXISTS trader_score (
    trader_id TEXT PRIMARY KEY,
    quality_score REAL NOT NULL,
    confidence TEXT NOT NULL,
    win_rate REAL,
    sample_size INTEGER NOT NULL,
    trader_weight REAL NOT NULL,
    updated_at TEXT NOT NULL,
    segment TEXT NOT NULL DEFAULT 'unknown'
);

CREATE TABLE IF NOT EXISTS event_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trader_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    kind TEXT NOT NULL,
    event_time TEXT,
    fetched_at TEXT NOT NULL,
    price REAL,
    amount REAL NOT NULL,
    realized_pnl REAL
);

CREATE INDEX IF NOT EXISTS idx_event_log_symbol_time
    ON event_log(symbol, event_time);
CREATE INDEX IF NOT EXISTS idx_event_log_trader
    ON event_log(trader_id, fetched_at);

CREATE TABLE IF NOT EXISTS position_state (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trader_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    direction TEXT NOT NULL,
    status TEXT NOT NULL,
    entry_price REAL NOT NULL,
    amount REAL NOT NULL,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    estimated_open_time TEXT NOT NULL,
    estimated_close_time TEXT,
    disappeared_at TEXT,
    leverage REAL,
    opening_event_id INTEGER,
    confidence REAL,
    mark_price REAL,
    unrealized_pnl REAL,
    UNIQUE(trader_id, symbol, direction)
);

CREATE INDEX IF NOT EXISTS idx_position_state_symbol_status
    ON position_state(symbol, status);

CREATE TABLE IF NOT EXISTS simulated_position (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    platform TEXT NOT NULL,
    symbol TEXT NOT NULL,
    direction TEXT NOT NULL,
    status TEXT NOT NULL,
    leverage REAL NOT NULL,
    margin_notional REAL NOT NULL,
    position_notional REAL NOT NULL,
    entry_price REAL NOT NULL,
    effective_entry_price REAL NOT NULL,
    exit_price REAL,
    opened_at TEXT NOT NULL,
    closed_at TEXT,
    close_reason TEXT,
    close_trigger_trader_id TEXT,
    close_trigger_event_kind TEXT,
    pnl_usdt REAL,
    roi_pct REAL,
    stop_loss_price REAL,
    take_profit_price REAL,
    trailing_stop_pct REAL,
    peak_favorable_price REAL,
    slippage_bps REAL NOT NULL,
    commission_bps REAL NOT NULL,
    portfolio_id TEXT NOT NULL,
    source TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_simulated_position_portfolio_status
    ON simulated_position(portfolio_id, status);

CREATE TABLE IF NOT EXISTS portfolio (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    initial_balance REAL NOT NULL,
    current_balance REAL NOT NULL,
    kelly_fraction REAL NOT NULL,
    min_sample_size INTEGER NOT NULL,
    max_risk_per_trade REAL NOT NULL,
    max_portfolio_risk REAL NOT NULL,
    max_open_positions INTEGER NOT NULL,
    default_slippage_bps REAL NOT NULL,
    default_commission_bps REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS auto_trigger_rule (
    id TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL,
    segment_filter TEXT NOT NULL,
    time_range_ms INTEGER NOT NULL,
    min_traders INTEGER NOT NULL,
    min_confidence REAL NOT NULL,
    min_sentiment_abs REAL NOT NULL,
    leverage REAL NOT NULL,
    margin_notional REAL NOT NULL,
    cooldown_minutes INTEGER NOT NULL,
    last_run_at TEXT,
    portfolio_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS insights_rule (
    id TEXT PRIMARY KEY,
    payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backtest_run (
    id TEXT PRIMARY KEY,
    created_at TEXT NOT NULL,
    config_json TEXT NOT NULL,
    result_json TEXT NOT NULL,
    persisted INTEGER NOT NULL
);
"#;
