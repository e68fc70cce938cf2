use std::fmt;
use std::str::FromStr;

use serde::Deserialize;

pub mod adapter;
pub mod descriptor;
mod rows;

pub use adapter::{QueryOutput, SchemaSource, TableSchema, TargetConnection};
pub use descriptor::ConnectionDescriptor;

/// System namespaces that are never surfaced to users or written into the
/// catalog, across all supported dialects.
pub const SYSTEM_SCHEMA_DENYLIST: [&str; 8] = [
    "information_schema",
    "pg_catalog",
    "pg_internal",
    "pg_temp_1",
    "pg_toast_temp_1",
    "pg_toast",
    "sys",
    "sys_temp_1",
];

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Malformed connection string: {0}")]
    MalformedConnectionString(String),

    #[error("Incomplete connection parameters: missing {field}")]
    IncompleteConnectionParameters { field: &'static str },

    #[error("Unsupported dialect {0:?}")]
    UnsupportedDialect(String),

    #[error("Target database unreachable: {0}")]
    TargetUnreachable(String),

    #[error("Query against target database failed: {0}")]
    QueryFailed(String),

    #[error("No active connection")]
    NoActiveConnection,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// The SQL database family of a target database. MariaDB keeps its own
/// identity in descriptors and persisted URLs even though it is reached
/// through the MySQL wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[serde(rename = "postgresql")]
    Postgres,
    MySql,
    MariaDb,
}

impl Dialect {
    pub fn default_port(&self) -> u16 {
        match self {
            Dialect::Postgres => 5432,
            Dialect::MySql | Dialect::MariaDb => 3306,
        }
    }

    /// The scheme used when assembling a connection URL for this dialect.
    pub fn scheme(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgresql",
            Dialect::MySql => "mysql",
            Dialect::MariaDb => "mariadb",
        }
    }
}

impl FromStr for Dialect {
    type Err = ConnectionError;

    fn from_str(s: &str) -> ConnectionResult<Self> {
        match s {
            "postgresql" | "postgres" => Ok(Dialect::Postgres),
            "mysql" => Ok(Dialect::MySql),
            "mariadb" => Ok(Dialect::MariaDb),
            other => Err(ConnectionError::UnsupportedDialect(other.to_string())),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}
