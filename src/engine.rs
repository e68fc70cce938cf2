//! Bounded caches for live target-database handles.
//!
//! Opening a driver pool and reflecting table structure are both expensive,
//! so the gateway keeps two LRU caches: one of connected engines keyed by
//! connection URL and one of reflected table handles keyed by
//! `(url, schema, table)`. Eviction of an engine closes its pool in the
//! background.

use std::sync::Arc;

use moka::future::{Cache, CacheBuilder, FutureExt};
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use tracing::{debug, warn};

use crate::config::schema::CacheSettings;
use crate::connection::{
    ConnectionDescriptor, ConnectionError, ConnectionResult, TableSchema,
    TargetConnection,
};

#[derive(Clone)]
pub struct EngineCache {
    engines: Cache<String, TargetConnection>,
    tables: Cache<(String, String, String), Arc<TableSchema>>,
}

impl EngineCache {
    pub fn new(settings: &CacheSettings) -> Self {
        let engines = CacheBuilder::new(settings.engine_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .async_eviction_listener(
                move |url: Arc<String>, mut conn: TargetConnection, cause| {
                    async move {
                        debug!(url = %url, ?cause, "Evicting engine");
                        // An entry replaced by `try_get_with` racing itself
                        // shares the pool with the winner; closing it would
                        // kill the cached engine too.
                        if cause == RemovalCause::Replaced {
                            return;
                        }
                        if let Err(error) = conn.close().await {
                            warn!(url = %url, %error, "Failed to close evicted engine");
                        }
                    }
                    .boxed()
                },
            )
            .build();

        let tables = CacheBuilder::new(settings.table_handle_capacity)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self { engines, tables }
    }

    /// Fetch a connected engine for the URL, connecting on first use.
    /// Concurrent callers for the same URL coalesce onto one connection
    /// attempt.
    pub async fn get_connection(&self, url: &str) -> ConnectionResult<TargetConnection> {
        self.engines
            .try_get_with(url.to_string(), async {
                let descriptor = ConnectionDescriptor::parse(url)?;
                let mut conn = TargetConnection::new(descriptor);
                conn.connect().await?;
                Ok::<_, ConnectionError>(conn)
            })
            .await
            .map_err(|e: Arc<ConnectionError>| (*e).clone())
    }

    /// Fetch the reflected structure of one table, reflecting on first use.
    pub async fn get_table_handle(
        &self,
        url: &str,
        schema: &str,
        table: &str,
    ) -> ConnectionResult<Arc<TableSchema>> {
        let key = (url.to_string(), schema.to_string(), table.to_string());
        self.tables
            .try_get_with(key, async {
                let conn = self.get_connection(url).await?;
                let reflected = conn.reflect_table(schema, table).await?;
                Ok::<_, ConnectionError>(Arc::new(reflected))
            })
            .await
            .map_err(|e: Arc<ConnectionError>| (*e).clone())
    }

}
