//! Sqlite-backed persistence (§4.3, §4.4, §4.7-§4.9, §4.12-§4.15).
//!
//! Every store shares one `Arc<parking_lot::Mutex<Connection>>` — sqlite
//! serializes writers anyway, and the critical sections here are short
//! enough that a blocking mutex beats a connection pool.

pub mod backtest_run;
pub mod db;
pub mod event_log;
pub mod portfolio;
pub mod position_state;
pub mod raw_ingest;
pub mod rules;
pub mod schema;
pub mod simulated_position;
pub mod trader_score;

pub use db::Db;
