use std::sync::Arc;

use crate::catalog::Catalog;
use crate::config::schema::SkimmerConfig;
use crate::engine::EngineCache;
use crate::sync::SyncQueue;

/// Shared state handed to every frontend handler.
#[derive(Clone)]
pub struct GatewayContext {
    pub config: SkimmerConfig,
    pub catalog: Arc<Catalog>,
    pub engines: EngineCache,
    pub sync: SyncQueue,
}

impl GatewayContext {
    pub fn session_ttl_seconds(&self) -> i64 {
        (self.config.auth.session_ttl_minutes * 60) as i64
    }
}
