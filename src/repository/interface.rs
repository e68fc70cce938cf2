use std::fmt::Debug;

use async_trait::async_trait;
use serde::Serialize;

/// Seconds since the Unix epoch; stored as a plain integer column in
/// both backends.
pub type Timestamp = i64;

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub disabled: bool,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub token: String,
    pub user_id: String,
    pub project_id: Option<String>,
    pub expires_at: Timestamp,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRecord {
    pub id: String,
    pub project_name: String,
    pub description: String,
    pub dialect: String,
    #[serde(skip_serializing)]
    pub connection_url: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq)]
pub struct MembershipRecord {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Join of a membership row with its project, used when listing the
/// projects a user belongs to.
#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MembershipProjectResult {
    pub project_id: String,
    pub project_name: String,
    pub description: String,
    pub dialect: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaRecord {
    pub id: String,
    pub project_id: String,
    pub schema_name: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableRecord {
    pub id: String,
    pub schema_id: String,
    pub table_name: String,
    pub schema_name: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(sqlx::FromRow, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnRecord {
    pub id: String,
    pub table_id: String,
    pub schema_id: String,
    pub column_name: String,
    pub table_name: String,
    pub schema_name: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Wrapper for conversion of database-specific error codes into actual errors
#[derive(Debug)]
pub enum Error {
    UniqueConstraintViolation(sqlx::Error),
    FKConstraintViolation(sqlx::Error),

    // All other errors
    SqlxError(sqlx::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[async_trait]
pub trait Repository: Send + Sync + Debug {
    async fn setup(&self);

    async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<UserRecord, Error>;

    async fn get_user_by_email(&self, email: &str) -> Result<UserRecord, Error>;

    async fn create_session(
        &self,
        token: &str,
        user_id: &str,
        project_id: Option<&str>,
        expires_at: Timestamp,
    ) -> Result<SessionRecord, Error>;

    /// Look up a session by token, only if it has not expired yet.
    async fn get_session(&self, token: &str) -> Result<SessionRecord, Error>;

    async fn create_project(
        &self,
        project_name: &str,
        description: &str,
        dialect: &str,
        connection_url: &str,
    ) -> Result<ProjectRecord, Error>;

    async fn get_project(&self, project_id: &str) -> Result<ProjectRecord, Error>;

    async fn create_membership(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<MembershipRecord, Error>;

    async fn get_membership(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<MembershipRecord, Error>;

    async fn list_memberships(
        &self,
        user_id: &str,
    ) -> Result<Vec<MembershipProjectResult>, Error>;

    /// Insert a schema row unless one with the same `(project_id,
    /// schema_name)` already exists. Returns `None` when the row was
    /// already present.
    async fn create_schema(
        &self,
        project_id: &str,
        schema_name: &str,
    ) -> Result<Option<SchemaRecord>, Error>;

    async fn get_schema(
        &self,
        project_id: &str,
        schema_name: &str,
    ) -> Result<SchemaRecord, Error>;

    async fn get_schema_by_id(&self, schema_id: &str) -> Result<SchemaRecord, Error>;

    async fn list_schemas(
        &self,
        project_id: &str,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SchemaRecord>, Error>;

    async fn count_schemas(
        &self,
        project_id: &str,
        search: Option<&str>,
    ) -> Result<i64, Error>;

    /// Conflict target is `(schema_id, table_name)`; `None` means the row
    /// was already present.
    async fn create_table(
        &self,
        schema_id: &str,
        table_name: &str,
        schema_name: &str,
    ) -> Result<Option<TableRecord>, Error>;

    async fn get_table(
        &self,
        schema_id: &str,
        table_name: &str,
    ) -> Result<TableRecord, Error>;

    async fn get_table_by_id(&self, table_id: &str) -> Result<TableRecord, Error>;

    async fn list_tables(
        &self,
        schema_id: &str,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TableRecord>, Error>;

    async fn count_tables(
        &self,
        schema_id: &str,
        search: Option<&str>,
    ) -> Result<i64, Error>;

    /// Conflict target is `(table_id, column_name)`; `None` means the row
    /// was already present.
    async fn create_column(
        &self,
        table_id: &str,
        schema_id: &str,
        column_name: &str,
        table_name: &str,
        schema_name: &str,
    ) -> Result<Option<ColumnRecord>, Error>;

    async fn get_column(
        &self,
        table_id: &str,
        column_name: &str,
    ) -> Result<ColumnRecord, Error>;

    async fn list_columns(
        &self,
        table_id: &str,
        limit: i64,
    ) -> Result<Vec<ColumnRecord>, Error>;

    async fn count_columns(&self, table_id: &str) -> Result<i64, Error>;
}

#[cfg(test)]
pub mod tests {
    use std::sync::Arc;

    use super::*;

    pub async fn run_generic_repository_tests(repository: Arc<dyn Repository>) {
        let user = test_create_user(repository.clone()).await;
        test_sessions(repository.clone(), &user).await;
        let project = test_projects_and_memberships(repository.clone(), &user).await;
        let schema = test_schema_conflicts(repository.clone(), &project).await;
        let table = test_table_listing(repository.clone(), &schema).await;
        test_column_conflicts(repository.clone(), &schema, &table).await;
        test_fk_violation(repository).await;
    }

    async fn test_create_user(repository: Arc<dyn Repository>) -> UserRecord {
        let user = repository
            .create_user("alice", "alice@example.com", "deadbeef")
            .await
            .expect("Error creating user");
        assert_eq!(user.username, "alice");
        assert!(!user.disabled);
        assert!(user.created_at > 0);
        // Rows are never mutated after insert, so both timestamps match
        assert_eq!(user.updated_at, user.created_at);

        // Same email again
        assert!(matches!(
            repository
                .create_user("alice2", "alice@example.com", "deadbeef")
                .await
                .unwrap_err(),
            Error::UniqueConstraintViolation(_)
        ));

        let fetched = repository
            .get_user_by_email("alice@example.com")
            .await
            .unwrap();
        assert_eq!(fetched, user);

        assert!(matches!(
            repository
                .get_user_by_email("nobody@example.com")
                .await
                .unwrap_err(),
            Error::SqlxError(sqlx::Error::RowNotFound)
        ));

        user
    }

    async fn test_sessions(repository: Arc<dyn Repository>, user: &UserRecord) {
        let far_future = 4102444800; // 2100-01-01
        let session = repository
            .create_session("token-1", &user.id, None, far_future)
            .await
            .unwrap();
        assert_eq!(session.project_id, None);

        let fetched = repository.get_session("token-1").await.unwrap();
        assert_eq!(fetched, session);

        // An expired session behaves like a missing one
        repository
            .create_session("token-2", &user.id, None, 1000)
            .await
            .unwrap();
        assert!(matches!(
            repository.get_session("token-2").await.unwrap_err(),
            Error::SqlxError(sqlx::Error::RowNotFound)
        ));
    }

    async fn test_projects_and_memberships(
        repository: Arc<dyn Repository>,
        user: &UserRecord,
    ) -> ProjectRecord {
        let project = repository
            .create_project(
                "warehouse",
                "main analytics warehouse",
                "postgresql",
                "postgresql://u:p@db.internal:5432/warehouse",
            )
            .await
            .unwrap();

        let fetched = repository.get_project(&project.id).await.unwrap();
        assert_eq!(fetched, project);

        repository
            .create_membership(&project.id, &user.id)
            .await
            .unwrap();

        // Membership is unique per (project, user)
        assert!(matches!(
            repository
                .create_membership(&project.id, &user.id)
                .await
                .unwrap_err(),
            Error::UniqueConstraintViolation(_)
        ));

        let membership = repository
            .get_membership(&project.id, &user.id)
            .await
            .unwrap();
        assert_eq!(membership.project_id, project.id);

        let memberships = repository.list_memberships(&user.id).await.unwrap();
        assert_eq!(
            memberships,
            vec![MembershipProjectResult {
                project_id: project.id.clone(),
                project_name: "warehouse".to_string(),
                description: "main analytics warehouse".to_string(),
                dialect: "postgresql".to_string(),
                created_at: project.created_at,
                updated_at: project.updated_at,
            }]
        );

        project
    }

    async fn test_schema_conflicts(
        repository: Arc<dyn Repository>,
        project: &ProjectRecord,
    ) -> SchemaRecord {
        let schema = repository
            .create_schema(&project.id, "public")
            .await
            .unwrap()
            .expect("first insert should create the row");

        // Second insert is a no-op, not an error
        assert_eq!(
            repository.create_schema(&project.id, "public").await.unwrap(),
            None
        );

        // The no-op rerun leaves the original row, timestamps included
        let fetched = repository.get_schema(&project.id, "public").await.unwrap();
        assert_eq!(fetched, schema);
        assert_eq!(fetched.created_at, schema.created_at);
        assert_eq!(fetched.updated_at, schema.updated_at);
        let by_id = repository.get_schema_by_id(&schema.id).await.unwrap();
        assert_eq!(by_id, schema);

        repository
            .create_schema(&project.id, "analytics")
            .await
            .unwrap()
            .expect("different name should create a row");

        assert_eq!(repository.count_schemas(&project.id, None).await.unwrap(), 2);

        // Alphabetical order
        let schemas = repository
            .list_schemas(&project.id, None, 10, 0)
            .await
            .unwrap();
        let names: Vec<_> = schemas.iter().map(|s| s.schema_name.as_str()).collect();
        assert_eq!(names, vec!["analytics", "public"]);

        // Substring filter
        let schemas = repository
            .list_schemas(&project.id, Some("lyt"), 10, 0)
            .await
            .unwrap();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].schema_name, "analytics");
        assert_eq!(
            repository.count_schemas(&project.id, Some("lyt")).await.unwrap(),
            1
        );

        // LIKE metacharacters in the filter match literally
        let schemas = repository
            .list_schemas(&project.id, Some("%"), 10, 0)
            .await
            .unwrap();
        assert!(schemas.is_empty());

        // Pagination
        let schemas = repository
            .list_schemas(&project.id, None, 1, 1)
            .await
            .unwrap();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].schema_name, "public");

        schema
    }

    async fn test_table_listing(
        repository: Arc<dyn Repository>,
        schema: &SchemaRecord,
    ) -> TableRecord {
        let orders = repository
            .create_table(&schema.id, "orders", &schema.schema_name)
            .await
            .unwrap()
            .expect("first insert should create the row");
        repository
            .create_table(&schema.id, "customers", &schema.schema_name)
            .await
            .unwrap()
            .expect("first insert should create the row");

        assert_eq!(
            repository
                .create_table(&schema.id, "orders", &schema.schema_name)
                .await
                .unwrap(),
            None
        );

        assert_eq!(repository.count_tables(&schema.id, None).await.unwrap(), 2);

        let tables = repository
            .list_tables(&schema.id, Some("ord"), 10, 0)
            .await
            .unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].table_name, "orders");

        let fetched = repository.get_table(&schema.id, "orders").await.unwrap();
        assert_eq!(fetched, orders);
        let by_id = repository.get_table_by_id(&orders.id).await.unwrap();
        assert_eq!(by_id, orders);

        orders
    }

    async fn test_column_conflicts(
        repository: Arc<dyn Repository>,
        schema: &SchemaRecord,
        table: &TableRecord,
    ) {
        for name in ["id", "amount", "created"] {
            repository
                .create_column(
                    &table.id,
                    &schema.id,
                    name,
                    &table.table_name,
                    &schema.schema_name,
                )
                .await
                .unwrap()
                .expect("first insert should create the row");
        }

        assert_eq!(
            repository
                .create_column(
                    &table.id,
                    &schema.id,
                    "amount",
                    &table.table_name,
                    &schema.schema_name,
                )
                .await
                .unwrap(),
            None
        );

        assert_eq!(repository.count_columns(&table.id).await.unwrap(), 3);

        let column = repository.get_column(&table.id, "amount").await.unwrap();
        assert_eq!(column.table_name, "orders");

        let columns = repository.list_columns(&table.id, 2).await.unwrap();
        assert_eq!(columns.len(), 2);
        // Alphabetical order
        assert_eq!(columns[0].column_name, "amount");
        assert_eq!(columns[1].column_name, "created");
    }

    async fn test_fk_violation(repository: Arc<dyn Repository>) {
        assert!(matches!(
            repository
                .create_schema("no-such-project", "public")
                .await
                .unwrap_err(),
            Error::FKConstraintViolation(_)
        ));
    }
}
