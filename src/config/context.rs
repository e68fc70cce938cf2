use std::sync::Arc;

use sqlx::sqlite::SqliteJournalMode;

use crate::{
    catalog::Catalog,
    context::GatewayContext,
    engine::EngineCache,
    repository::{
        interface::Repository, postgres::PostgresRepository, sqlite::SqliteRepository,
    },
    sync::SyncQueue,
};

use super::schema;

async fn build_catalog(config: &schema::SkimmerConfig) -> Catalog {
    // Initialize the repository
    let repository: Arc<dyn Repository> = match &config.catalog {
        schema::Catalog::Postgres(schema::Postgres { dsn, schema }) => Arc::new(
            PostgresRepository::try_new(dsn.to_string(), schema.to_string())
                .await
                .expect("Error setting up the database"),
        ),
        schema::Catalog::Sqlite(schema::Sqlite { dsn }) => Arc::new(
            SqliteRepository::try_new(dsn.to_string(), SqliteJournalMode::Wal)
                .await
                .expect("Error setting up the database"),
        ),
    };

    Catalog::new(repository)
}

pub async fn build_context(cfg: schema::SkimmerConfig) -> GatewayContext {
    let catalog = Arc::new(build_catalog(&cfg).await);
    let engines = EngineCache::new(&cfg.cache);
    let sync = SyncQueue::start(catalog.clone(), &cfg.sync);

    GatewayContext {
        config: cfg,
        catalog,
        engines,
        sync,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_config_to_context() {
        let config = schema::SkimmerConfig {
            catalog: schema::Catalog::Sqlite(schema::Sqlite {
                dsn: "sqlite::memory:".to_string(),
            }),
            frontend: Default::default(),
            sync: Default::default(),
            cache: Default::default(),
            auth: Default::default(),
        };

        let context = build_context(config).await;

        // The catalog is usable after startup
        let user = context
            .catalog
            .create_user("alice", "alice@example.com", "deadbeef")
            .await
            .unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(context.session_ttl_seconds(), 3600);
    }
}
