use std::time::Duration;

use tracing::debug;

use crate::value::Params;

/// Hooks around every statement a session sends to the database.
pub trait QueryObserver: Send + Sync {
    fn on_query_start(&self, _sql: &str, _params: &Params) {}

    fn on_query_end(&self, _sql: &str, _elapsed: Duration) {}
}

/// Logs statements at `debug` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl QueryObserver for TracingObserver {
    fn on_query_start(&self, sql: &str, params: &Params) {
        debug!(sql, params = ?params.values, "query start");
    }

    fn on_query_end(&self, sql: &str, elapsed: Duration) {
        debug!(sql, elapsed_ms = elapsed.as_secs_f64() * 1000.0, "query end");
    }
}
