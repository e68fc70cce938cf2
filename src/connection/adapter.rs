use std::time::Duration;

use async_trait::async_trait;
use itertools::Itertools;
use serde::Serialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::debug;

use super::rows::{mysql_row_to_object, pg_row_to_object};
use super::{
    ConnectionDescriptor, ConnectionError, ConnectionResult, Dialect,
    SYSTEM_SCHEMA_DENYLIST,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TARGET_CONNECTIONS: u32 = 5;

pub type JsonRow = serde_json::Map<String, serde_json::Value>;

/// Result of executing arbitrary SQL text against a target database.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum QueryOutput {
    Rows { data: Vec<JsonRow> },
    Executed { rows_affected: u64 },
}

/// One-time structural reflection of a live table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub schema_name: String,
    pub table_name: String,
    pub columns: Vec<ReflectedColumn>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReflectedColumn {
    pub name: String,
    pub data_type: String,
}

/// The information-schema walk needed by the catalog synchronizer,
/// decoupled from a live connection so the sync logic can be tested
/// against a stub target.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Namespaces in the target, minus the system-schema denylist.
    async fn list_schemas(&self) -> ConnectionResult<Vec<String>>;

    /// `(table_name, schema_name)` pairs within one namespace.
    async fn list_tables(&self, schema: &str) -> ConnectionResult<Vec<(String, String)>>;

    /// `(column_name, table_name)` pairs for one table.
    async fn list_columns(&self, table: &str) -> ConnectionResult<Vec<(String, String)>>;
}

#[derive(Debug, Clone)]
pub enum TargetPool {
    Postgres(PgPool),
    MySql(MySqlPool),
}

/// A dialect adapter over one target database: assembles the driver
/// connection, probes it, and runs information-schema and data queries.
///
/// Holding the pool in an `Option` gives `connect`/`close` the explicit
/// lifecycle the gateway needs: using an adapter before `connect` (or after
/// `close`) fails with `NoActiveConnection` instead of panicking.
#[derive(Debug, Clone)]
pub struct TargetConnection {
    descriptor: ConnectionDescriptor,
    pool: Option<TargetPool>,
}

impl TargetConnection {
    /// Store the connection parameters without connecting.
    pub fn new(descriptor: ConnectionDescriptor) -> Self {
        Self {
            descriptor,
            pool: None,
        }
    }

    pub fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Open the driver pool and probe it with `SELECT 1`. Network and
    /// authentication failures both surface as `TargetUnreachable`; the
    /// caller decides whether to retry.
    pub async fn connect(&mut self) -> ConnectionResult<()> {
        let d = &self.descriptor;

        let pool = match d.dialect {
            Dialect::Postgres => {
                let options = PgConnectOptions::new()
                    .host(&d.host)
                    .port(d.port)
                    .username(&d.username)
                    .password(&d.password)
                    .database(&d.database);

                let pool = PgPoolOptions::new()
                    .max_connections(MAX_TARGET_CONNECTIONS)
                    .acquire_timeout(CONNECT_TIMEOUT)
                    .connect_with(options)
                    .await
                    .map_err(|e| ConnectionError::TargetUnreachable(e.to_string()))?;
                TargetPool::Postgres(pool)
            }
            Dialect::MySql | Dialect::MariaDb => {
                let mut options = MySqlConnectOptions::new()
                    .host(&d.host)
                    .port(d.port)
                    .username(&d.username)
                    .password(&d.password)
                    .database(&d.database);

                // The descriptor keeps extras opaque; the adapter applies the
                // ones the driver understands and ignores the rest.
                for (key, value) in extra_params(d.extras.as_deref()) {
                    match key {
                        "charset" => options = options.charset(value),
                        "collation" => options = options.collation(value),
                        other => debug!(param = other, "Ignoring extra connection parameter"),
                    }
                }

                let pool = MySqlPoolOptions::new()
                    .max_connections(MAX_TARGET_CONNECTIONS)
                    .acquire_timeout(CONNECT_TIMEOUT)
                    .connect_with(options)
                    .await
                    .map_err(|e| ConnectionError::TargetUnreachable(e.to_string()))?;
                TargetPool::MySql(pool)
            }
        };

        // Probe before declaring the connection usable
        match &pool {
            TargetPool::Postgres(p) => sqlx::query("SELECT 1").execute(p).await.map(|_| ()),
            TargetPool::MySql(p) => sqlx::query("SELECT 1").execute(p).await.map(|_| ()),
        }
        .map_err(|e| ConnectionError::TargetUnreachable(e.to_string()))?;

        self.pool = Some(pool);
        Ok(())
    }

    /// Release the pool. Closing twice, or without connecting first, is an
    /// adapter misuse error.
    pub async fn close(&mut self) -> ConnectionResult<()> {
        match self.pool.take() {
            Some(TargetPool::Postgres(pool)) => {
                pool.close().await;
                Ok(())
            }
            Some(TargetPool::MySql(pool)) => {
                pool.close().await;
                Ok(())
            }
            None => Err(ConnectionError::NoActiveConnection),
        }
    }

    fn pool(&self) -> ConnectionResult<&TargetPool> {
        self.pool.as_ref().ok_or(ConnectionError::NoActiveConnection)
    }

    /// Reflect the column structure of exactly one table, in ordinal order.
    pub async fn reflect_table(
        &self,
        schema: &str,
        table: &str,
    ) -> ConnectionResult<TableSchema> {
        let pool = self.pool()?;
        let columns: Vec<(String, String)> = bounded("table reflection", QUERY_TIMEOUT, async {
            match pool {
                TargetPool::Postgres(pool) => sqlx::query_as(
                    "SELECT column_name, data_type FROM information_schema.columns \
                     WHERE table_schema = $1 AND table_name = $2 ORDER BY ordinal_position",
                )
                .bind(schema)
                .bind(table)
                .fetch_all(pool)
                .await
                .map_err(query_error),
                TargetPool::MySql(pool) => sqlx::query_as(
                    "SELECT column_name, data_type FROM information_schema.columns \
                     WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
                )
                .bind(schema)
                .bind(table)
                .fetch_all(pool)
                .await
                .map_err(query_error),
            }
        })
        .await?;

        if columns.is_empty() {
            return Err(ConnectionError::QueryFailed(format!(
                "table {schema}.{table} not found in target database"
            )));
        }

        Ok(TableSchema {
            schema_name: schema.to_string(),
            table_name: table.to_string(),
            columns: columns
                .into_iter()
                .map(|(name, data_type)| ReflectedColumn { name, data_type })
                .collect(),
        })
    }

    /// Bounded read of a table's rows, plus the total row count.
    pub async fn fetch_rows(
        &self,
        schema: &str,
        table: &str,
        limit: i64,
        offset: i64,
    ) -> ConnectionResult<(Vec<JsonRow>, i64)> {
        let pool = self.pool()?;
        bounded("row fetch", QUERY_TIMEOUT, async {
            match pool {
                TargetPool::Postgres(pool) => {
                    let relation =
                        format!("{}.{}", quote_double(schema), quote_double(table));
                    let rows = sqlx::query(&format!(
                        "SELECT * FROM {relation} LIMIT {limit} OFFSET {offset}"
                    ))
                    .fetch_all(pool)
                    .await
                    .map_err(query_error)?;
                    let total: i64 =
                        sqlx::query(&format!("SELECT COUNT(*) FROM {relation}"))
                            .fetch_one(pool)
                            .await
                            .map_err(query_error)?
                            .try_get(0)
                            .map_err(query_error)?;

                    Ok((rows.iter().map(pg_row_to_object).collect(), total))
                }
                TargetPool::MySql(pool) => {
                    let relation =
                        format!("{}.{}", quote_backtick(schema), quote_backtick(table));
                    let rows = sqlx::query(&format!(
                        "SELECT * FROM {relation} LIMIT {limit} OFFSET {offset}"
                    ))
                    .fetch_all(pool)
                    .await
                    .map_err(query_error)?;
                    let total: i64 =
                        sqlx::query(&format!("SELECT COUNT(*) FROM {relation}"))
                            .fetch_one(pool)
                            .await
                            .map_err(query_error)?
                            .try_get(0)
                            .map_err(query_error)?;

                    Ok((rows.iter().map(mysql_row_to_object).collect(), total))
                }
            }
        })
        .await
    }

    /// Run arbitrary SQL text. Row-returning statements come back as JSON
    /// row mappings; everything else as a rows-affected confirmation. The
    /// text is not validated or sandboxed, the target database's own
    /// privilege model is the backstop.
    pub async fn execute_sql(&self, sql: &str) -> ConnectionResult<QueryOutput> {
        let returns_rows = statement_returns_rows(sql);

        let pool = self.pool()?;
        bounded("query execution", QUERY_TIMEOUT, async {
            match pool {
                TargetPool::Postgres(pool) => {
                    if returns_rows {
                        let rows = sqlx::query(sql)
                            .fetch_all(pool)
                            .await
                            .map_err(query_error)?;
                        Ok(QueryOutput::Rows {
                            data: rows.iter().map(pg_row_to_object).collect(),
                        })
                    } else {
                        let result =
                            sqlx::query(sql).execute(pool).await.map_err(query_error)?;
                        Ok(QueryOutput::Executed {
                            rows_affected: result.rows_affected(),
                        })
                    }
                }
                TargetPool::MySql(pool) => {
                    if returns_rows {
                        let rows = sqlx::query(sql)
                            .fetch_all(pool)
                            .await
                            .map_err(query_error)?;
                        Ok(QueryOutput::Rows {
                            data: rows.iter().map(mysql_row_to_object).collect(),
                        })
                    } else {
                        let result =
                            sqlx::query(sql).execute(pool).await.map_err(query_error)?;
                        Ok(QueryOutput::Executed {
                            rows_affected: result.rows_affected(),
                        })
                    }
                }
            }
        })
        .await
    }
}

#[async_trait]
impl SchemaSource for TargetConnection {
    async fn list_schemas(&self) -> ConnectionResult<Vec<String>> {
        let pool = self.pool()?;
        bounded("schema listing", QUERY_TIMEOUT, async {
            match pool {
                TargetPool::Postgres(pool) => {
                    // The denylist entries are fixed constants, safe to inline
                    let denylist = SYSTEM_SCHEMA_DENYLIST
                        .iter()
                        .map(|s| format!("'{s}'"))
                        .join(", ");
                    let names: Vec<(String,)> = sqlx::query_as(&format!(
                        "SELECT schema_name FROM information_schema.schemata \
                         WHERE schema_name NOT IN ({denylist})"
                    ))
                    .fetch_all(pool)
                    .await
                    .map_err(query_error)?;
                    Ok(names.into_iter().map(|(n,)| n).collect())
                }
                // MySQL and MariaDB conflate "schema" and "database":
                // enumeration is restricted to the single database named in
                // the descriptor
                TargetPool::MySql(pool) => {
                    let names: Vec<(String,)> = sqlx::query_as(
                        "SELECT schema_name FROM information_schema.schemata \
                         WHERE schema_name = ?",
                    )
                    .bind(&self.descriptor.database)
                    .fetch_all(pool)
                    .await
                    .map_err(query_error)?;
                    Ok(names.into_iter().map(|(n,)| n).collect())
                }
            }
        })
        .await
    }

    async fn list_tables(&self, schema: &str) -> ConnectionResult<Vec<(String, String)>> {
        let pool = self.pool()?;
        bounded("table listing", QUERY_TIMEOUT, async {
            match pool {
                TargetPool::Postgres(pool) => sqlx::query_as(
                    "SELECT table_name, table_schema FROM information_schema.tables \
                     WHERE table_schema = $1",
                )
                .bind(schema)
                .fetch_all(pool)
                .await
                .map_err(query_error),
                TargetPool::MySql(pool) => sqlx::query_as(
                    "SELECT table_name, table_schema FROM information_schema.tables \
                     WHERE table_schema = ?",
                )
                .bind(schema)
                .fetch_all(pool)
                .await
                .map_err(query_error),
            }
        })
        .await
    }

    async fn list_columns(&self, table: &str) -> ConnectionResult<Vec<(String, String)>> {
        let pool = self.pool()?;
        bounded("column listing", QUERY_TIMEOUT, async {
            match pool {
                TargetPool::Postgres(pool) => sqlx::query_as(
                    "SELECT column_name, table_name FROM information_schema.columns \
                     WHERE table_name = $1",
                )
                .bind(table)
                .fetch_all(pool)
                .await
                .map_err(query_error),
                // Scope to the descriptor's database so same-named tables in
                // other databases on the server don't leak in
                TargetPool::MySql(pool) => sqlx::query_as(
                    "SELECT column_name, table_name FROM information_schema.columns \
                     WHERE table_name = ? AND table_schema = ?",
                )
                .bind(table)
                .bind(&self.descriptor.database)
                .fetch_all(pool)
                .await
                .map_err(query_error),
            }
        })
        .await
    }
}

fn query_error(error: sqlx::Error) -> ConnectionError {
    ConnectionError::QueryFailed(error.to_string())
}

/// Bound a target-database call with a deadline. A hung target must not pin
/// a sync worker or a request handler; driver-side statement timeouts are
/// not relied on.
async fn bounded<T>(
    op: &'static str,
    limit: Duration,
    fut: impl std::future::Future<Output = ConnectionResult<T>>,
) -> ConnectionResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::QueryFailed(format!(
            "{op} timed out after {}s",
            limit.as_secs()
        ))),
    }
}

fn extra_params(extras: Option<&str>) -> impl Iterator<Item = (&str, &str)> {
    extras
        .unwrap_or_default()
        .split('&')
        .filter_map(|pair| pair.split_once('='))
}

/// Whether a SQL statement is expected to produce a result set.
fn statement_returns_rows(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    matches!(
        keyword.as_str(),
        "select" | "with" | "show" | "explain" | "describe" | "values"
    )
}

pub fn quote_double(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn quote_backtick(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}
