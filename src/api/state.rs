//! Shared server state and the coarse-grained per-id locks mutating
//! handlers serialize on (§5).
//!
//! Reads never take these locks — only handlers that mutate a portfolio's
//! balance/positions or an auto-trigger rule's cooldown clock do, and they
//! take exactly one lock for the duration of the handler.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::Config;
use crate::storage::Db;

#[derive(Clone)]
pub struct AppState {
    pub db: Db,
    pub config: Arc<Config>,
    locks: Arc<LockTable>,
}

struct LockTable {
    portfolios: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    rules: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

fn get_or_insert(table: &Mutex<HashMap<String, Arc<AsyncMutex<()>>>>, id: &str) -> Arc<AsyncMutex<()>> {
    let mut map = table.lock();
    map.entry(id.to_string())
        .or_insert_with(|| Arc::new(AsyncMutex::new(())))
        .clone()
}

impl AppState {
    pub fn new(db: Db, config: Config) -> Self {
        Self {
            db,
            config: Arc::new(config),
            locks: Arc::new(LockTable {
                portfolios: Mutex::new(HashMap::new()),
                rules: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The lock a mutating portfolio handler (open/close position,
    /// reconcile, report) must hold for its whole duration.
    pub fn portfolio_lock(&self, portfolio_id: &str) -> Arc<AsyncMutex<()>> {
        get_or_insert(&self.locks.portfolios, portfolio_id)
    }

    /// The lock an auto-trigger handler (update rule, run, dry-run) must
    /// hold for its whole duration. Rules are singletons by id (§9), so
    /// this is keyed the same way as the rule row itself.
    pub fn rule_lock(&self, rule_id: &str) -> Arc<AsyncMutex<()>> {
        get_or_insert(&self.locks.rules, rule_id)
    }
}
