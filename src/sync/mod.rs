//! Background catalog synchronizer.
//!
//! Projects are synced off the request path: registering a project enqueues
//! a job, and a fixed pool of workers walks the target's information schema,
//! inserting any schemas, tables and columns the catalog doesn't know about
//! yet. Sync is additive: rows dropped from the target are kept in the
//! catalog.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::config::schema::SyncSettings;
use crate::connection::{ConnectionDescriptor, SchemaSource, TargetConnection};

const QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone)]
pub struct SyncJob {
    pub project_id: String,
    pub connection_url: String,
}

/// Tally of one sync run. Failures in one branch of the walk are recorded
/// here and don't abort the rest of the run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub schemas_created: u64,
    pub tables_created: u64,
    pub columns_created: u64,
    pub branch_errors: Vec<String>,
}

impl SyncOutcome {
    fn merge(&mut self, other: SyncOutcome) {
        self.schemas_created += other.schemas_created;
        self.tables_created += other.tables_created;
        self.columns_created += other.columns_created;
        self.branch_errors.extend(other.branch_errors);
    }
}

/// Handle for submitting sync jobs to the worker pool.
#[derive(Clone)]
pub struct SyncQueue {
    tx: mpsc::Sender<SyncJob>,
}

impl SyncQueue {
    /// Spawn the worker pool. Workers share one receiver; each picks up the
    /// next job as it becomes free, so at most `settings.workers` targets
    /// are being walked at any time.
    pub fn start(catalog: Arc<Catalog>, settings: &SyncSettings) -> Self {
        let (tx, rx) = mpsc::channel::<SyncJob>(QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..settings.workers {
            let rx = rx.clone();
            let catalog = catalog.clone();
            let fanout = settings.table_fanout;

            tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(job) = job else {
                        // Queue dropped, shut the worker down
                        break;
                    };

                    info!(worker_id, project_id = %job.project_id, "Starting catalog sync");
                    run_job(&catalog, &job, fanout).await;
                }
            });
        }

        Self { tx }
    }

    /// Submit a job. Returns `false` when the queue is full or the pool has
    /// shut down; the caller can retry a rejected job later.
    pub fn submit(&self, job: SyncJob) -> bool {
        match self.tx.try_send(job) {
            Ok(()) => true,
            Err(e) => {
                warn!(%e, "Rejected sync job");
                false
            }
        }
    }
}

async fn run_job(catalog: &Catalog, job: &SyncJob, fanout: usize) {
    let descriptor = match ConnectionDescriptor::parse(&job.connection_url) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            error!(project_id = %job.project_id, %e, "Invalid connection URL, skipping sync");
            return;
        }
    };

    let mut conn = TargetConnection::new(descriptor);
    let d = conn.descriptor();
    info!(
        project_id = %job.project_id,
        dialect = %d.dialect,
        host = %d.host,
        database = %d.database,
        "Connecting to sync target"
    );
    if let Err(e) = conn.connect().await {
        warn!(project_id = %job.project_id, %e, "Target unreachable, skipping sync");
        return;
    }

    let outcome = run_sync(catalog, &job.project_id, &conn, fanout).await;

    if let Err(e) = conn.close().await {
        warn!(project_id = %job.project_id, %e, "Error closing sync connection");
    }

    if outcome.branch_errors.is_empty() {
        info!(
            project_id = %job.project_id,
            schemas = outcome.schemas_created,
            tables = outcome.tables_created,
            columns = outcome.columns_created,
            "Catalog sync finished"
        );
    } else {
        warn!(
            project_id = %job.project_id,
            schemas = outcome.schemas_created,
            tables = outcome.tables_created,
            columns = outcome.columns_created,
            errors = ?outcome.branch_errors,
            "Catalog sync finished with errors"
        );
    }
}

/// Walk the target's namespaces and record everything new in the catalog.
/// Schemas are processed sequentially; tables within a schema are reflected
/// `fanout` at a time. The target pool caps concurrent sessions regardless.
pub async fn run_sync(
    catalog: &Catalog,
    project_id: &str,
    source: &impl SchemaSource,
    fanout: usize,
) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();

    let schemas = match source.list_schemas().await {
        Ok(schemas) => schemas,
        Err(e) => {
            outcome.branch_errors.push(format!("listing schemas: {e}"));
            return outcome;
        }
    };

    for schema_name in schemas {
        outcome.merge(sync_schema(catalog, project_id, source, &schema_name, fanout).await);
    }

    outcome
}

async fn sync_schema(
    catalog: &Catalog,
    project_id: &str,
    source: &impl SchemaSource,
    schema_name: &str,
    fanout: usize,
) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();

    let (schema, created) = match catalog.ensure_schema(project_id, schema_name).await {
        Ok(result) => result,
        Err(e) => {
            outcome
                .branch_errors
                .push(format!("schema {schema_name}: {e}"));
            return outcome;
        }
    };
    if created {
        outcome.schemas_created += 1;
    }

    let tables = match source.list_tables(schema_name).await {
        Ok(tables) => tables,
        Err(e) => {
            outcome
                .branch_errors
                .push(format!("listing tables in {schema_name}: {e}"));
            return outcome;
        }
    };

    let results: Vec<SyncOutcome> = stream::iter(tables)
        .map(|(table_name, table_schema)| {
            let schema_id = schema.id.clone();
            async move {
                sync_table(catalog, source, &schema_id, &table_name, &table_schema).await
            }
        })
        .buffer_unordered(fanout)
        .collect()
        .await;

    for result in results {
        outcome.merge(result);
    }

    outcome
}

async fn sync_table(
    catalog: &Catalog,
    source: &impl SchemaSource,
    schema_id: &str,
    table_name: &str,
    schema_name: &str,
) -> SyncOutcome {
    let mut outcome = SyncOutcome::default();

    let (table, created) = match catalog
        .ensure_table(schema_id, table_name, schema_name)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            outcome
                .branch_errors
                .push(format!("table {schema_name}.{table_name}: {e}"));
            return outcome;
        }
    };
    if created {
        outcome.tables_created += 1;
    }

    let columns = match source.list_columns(table_name).await {
        Ok(columns) => columns,
        Err(e) => {
            outcome
                .branch_errors
                .push(format!("listing columns in {schema_name}.{table_name}: {e}"));
            return outcome;
        }
    };

    for (column_name, column_table) in columns {
        match catalog
            .ensure_column(&table.id, schema_id, &column_name, &column_table, schema_name)
            .await
        {
            Ok((_, true)) => outcome.columns_created += 1,
            Ok((_, false)) => {}
            Err(e) => outcome.branch_errors.push(format!(
                "column {schema_name}.{table_name}.{column_name}: {e}"
            )),
        }
    }

    outcome
}
