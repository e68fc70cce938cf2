//! Metadata catalog over a [`Repository`] backend: translates driver-level
//! errors into domain errors and holds the idempotent `ensure_*` operations
//! the synchronizer relies on.

use std::sync::Arc;

use crate::repository::interface::{
    ColumnRecord, Error as RepositoryError, MembershipProjectResult, MembershipRecord,
    ProjectRecord, Repository, SchemaRecord, SessionRecord, TableRecord, Timestamp,
    UserRecord,
};

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("User with email {email:?} already exists")]
    UserAlreadyExists { email: String },

    #[error("User with email {email:?} doesn't exist")]
    UserDoesNotExist { email: String },

    #[error("Session is invalid or has expired")]
    InvalidSession,

    #[error("Project {id:?} doesn't exist")]
    ProjectDoesNotExist { id: String },

    #[error("User is not a member of the project")]
    NotAMember,

    #[error("Schema {id:?} doesn't exist")]
    SchemaDoesNotExist { id: String },

    #[error("Table {id:?} doesn't exist")]
    TableDoesNotExist { id: String },

    #[error("Internal SQL error: {0:?}")]
    SqlxError(sqlx::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Default conversion for repository errors that call sites don't interpret
/// further.
impl From<RepositoryError> for CatalogError {
    fn from(err: RepositoryError) -> CatalogError {
        CatalogError::SqlxError(match err {
            RepositoryError::UniqueConstraintViolation(e) => e,
            RepositoryError::FKConstraintViolation(e) => e,
            RepositoryError::SqlxError(e) => e,
        })
    }
}

#[derive(Clone)]
pub struct Catalog {
    repository: Arc<dyn Repository>,
}

impl Catalog {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    // Users and sessions

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> CatalogResult<UserRecord> {
        self.repository
            .create_user(username, email, password_hash)
            .await
            .map_err(|e| match e {
                RepositoryError::UniqueConstraintViolation(_) => {
                    CatalogError::UserAlreadyExists {
                        email: email.to_string(),
                    }
                }
                e => e.into(),
            })
    }

    pub async fn get_user_by_email(&self, email: &str) -> CatalogResult<UserRecord> {
        self.repository
            .get_user_by_email(email)
            .await
            .map_err(|e| match e {
                RepositoryError::SqlxError(sqlx::Error::RowNotFound) => {
                    CatalogError::UserDoesNotExist {
                        email: email.to_string(),
                    }
                }
                e => e.into(),
            })
    }

    pub async fn create_session(
        &self,
        token: &str,
        user_id: &str,
        project_id: Option<&str>,
        expires_at: Timestamp,
    ) -> CatalogResult<SessionRecord> {
        Ok(self
            .repository
            .create_session(token, user_id, project_id, expires_at)
            .await?)
    }

    pub async fn get_session(&self, token: &str) -> CatalogResult<SessionRecord> {
        self.repository.get_session(token).await.map_err(|e| match e {
            RepositoryError::SqlxError(sqlx::Error::RowNotFound) => {
                CatalogError::InvalidSession
            }
            e => e.into(),
        })
    }

    // Projects and memberships

    pub async fn create_project(
        &self,
        project_name: &str,
        description: &str,
        dialect: &str,
        connection_url: &str,
    ) -> CatalogResult<ProjectRecord> {
        Ok(self
            .repository
            .create_project(project_name, description, dialect, connection_url)
            .await?)
    }

    pub async fn get_project(&self, project_id: &str) -> CatalogResult<ProjectRecord> {
        self.repository
            .get_project(project_id)
            .await
            .map_err(|e| match e {
                RepositoryError::SqlxError(sqlx::Error::RowNotFound) => {
                    CatalogError::ProjectDoesNotExist {
                        id: project_id.to_string(),
                    }
                }
                e => e.into(),
            })
    }

    pub async fn add_member(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> CatalogResult<MembershipRecord> {
        Ok(self
            .repository
            .create_membership(project_id, user_id)
            .await?)
    }

    /// Fails with `NotAMember` unless the user belongs to the project.
    pub async fn require_membership(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> CatalogResult<MembershipRecord> {
        self.repository
            .get_membership(project_id, user_id)
            .await
            .map_err(|e| match e {
                RepositoryError::SqlxError(sqlx::Error::RowNotFound) => {
                    CatalogError::NotAMember
                }
                e => e.into(),
            })
    }

    pub async fn list_projects(
        &self,
        user_id: &str,
    ) -> CatalogResult<Vec<MembershipProjectResult>> {
        Ok(self.repository.list_memberships(user_id).await?)
    }

    // Synced metadata

    /// Idempotent schema insert: returns the record and whether this call
    /// created it. A concurrent insert losing the race falls back to reading
    /// the winner's row.
    pub async fn ensure_schema(
        &self,
        project_id: &str,
        schema_name: &str,
    ) -> CatalogResult<(SchemaRecord, bool)> {
        match self.repository.create_schema(project_id, schema_name).await {
            Ok(Some(schema)) => Ok((schema, true)),
            Ok(None) => Ok((
                self.repository.get_schema(project_id, schema_name).await?,
                false,
            )),
            Err(RepositoryError::UniqueConstraintViolation(_)) => Ok((
                self.repository.get_schema(project_id, schema_name).await?,
                false,
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn ensure_table(
        &self,
        schema_id: &str,
        table_name: &str,
        schema_name: &str,
    ) -> CatalogResult<(TableRecord, bool)> {
        match self
            .repository
            .create_table(schema_id, table_name, schema_name)
            .await
        {
            Ok(Some(table)) => Ok((table, true)),
            Ok(None) => Ok((
                self.repository.get_table(schema_id, table_name).await?,
                false,
            )),
            Err(RepositoryError::UniqueConstraintViolation(_)) => Ok((
                self.repository.get_table(schema_id, table_name).await?,
                false,
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn ensure_column(
        &self,
        table_id: &str,
        schema_id: &str,
        column_name: &str,
        table_name: &str,
        schema_name: &str,
    ) -> CatalogResult<(ColumnRecord, bool)> {
        match self
            .repository
            .create_column(table_id, schema_id, column_name, table_name, schema_name)
            .await
        {
            Ok(Some(column)) => Ok((column, true)),
            Ok(None) => Ok((
                self.repository.get_column(table_id, column_name).await?,
                false,
            )),
            Err(RepositoryError::UniqueConstraintViolation(_)) => Ok((
                self.repository.get_column(table_id, column_name).await?,
                false,
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_schema_by_id(&self, schema_id: &str) -> CatalogResult<SchemaRecord> {
        self.repository
            .get_schema_by_id(schema_id)
            .await
            .map_err(|e| match e {
                RepositoryError::SqlxError(sqlx::Error::RowNotFound) => {
                    CatalogError::SchemaDoesNotExist {
                        id: schema_id.to_string(),
                    }
                }
                e => e.into(),
            })
    }

    pub async fn get_table(
        &self,
        schema_id: &str,
        table_name: &str,
    ) -> CatalogResult<TableRecord> {
        self.repository
            .get_table(schema_id, table_name)
            .await
            .map_err(|e| match e {
                RepositoryError::SqlxError(sqlx::Error::RowNotFound) => {
                    CatalogError::TableDoesNotExist {
                        id: table_name.to_string(),
                    }
                }
                e => e.into(),
            })
    }

    pub async fn get_table_by_id(&self, table_id: &str) -> CatalogResult<TableRecord> {
        self.repository
            .get_table_by_id(table_id)
            .await
            .map_err(|e| match e {
                RepositoryError::SqlxError(sqlx::Error::RowNotFound) => {
                    CatalogError::TableDoesNotExist {
                        id: table_id.to_string(),
                    }
                }
                e => e.into(),
            })
    }

    pub async fn list_schemas(
        &self,
        project_id: &str,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> CatalogResult<(Vec<SchemaRecord>, i64)> {
        let schemas = self
            .repository
            .list_schemas(project_id, search, limit, offset)
            .await?;
        let total = self.repository.count_schemas(project_id, search).await?;
        Ok((schemas, total))
    }

    pub async fn list_tables(
        &self,
        schema_id: &str,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> CatalogResult<(Vec<TableRecord>, i64)> {
        let tables = self
            .repository
            .list_tables(schema_id, search, limit, offset)
            .await?;
        let total = self.repository.count_tables(schema_id, search).await?;
        Ok((tables, total))
    }

    pub async fn list_columns(
        &self,
        table_id: &str,
        limit: i64,
    ) -> CatalogResult<(Vec<ColumnRecord>, i64)> {
        let columns = self.repository.list_columns(table_id, limit).await?;
        let total = self.repository.count_columns(table_id).await?;
        Ok((columns, total))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sqlx::sqlite::SqliteJournalMode;

    use super::*;
    use crate::repository::sqlite::SqliteRepository;

    async fn make_catalog() -> Catalog {
        let repository = SqliteRepository::try_new(
            "sqlite::memory:".to_string(),
            SqliteJournalMode::Wal,
        )
        .await
        .unwrap();
        Catalog::new(Arc::new(repository))
    }

    #[tokio::test]
    async fn test_user_error_mapping() {
        let catalog = make_catalog().await;

        catalog
            .create_user("bob", "bob@example.com", "cafebabe")
            .await
            .unwrap();

        assert!(matches!(
            catalog
                .create_user("bob", "bob@example.com", "cafebabe")
                .await
                .unwrap_err(),
            CatalogError::UserAlreadyExists { .. }
        ));

        assert!(matches!(
            catalog.get_user_by_email("eve@example.com").await.unwrap_err(),
            CatalogError::UserDoesNotExist { .. }
        ));

        assert!(matches!(
            catalog.get_session("no-such-token").await.unwrap_err(),
            CatalogError::InvalidSession
        ));
    }

    #[tokio::test]
    async fn test_ensure_schema_created_flag() {
        let catalog = make_catalog().await;
        let project = catalog
            .create_project("p", "", "postgresql", "postgresql://u:p@h:5432/d")
            .await
            .unwrap();

        let (first, created) = catalog.ensure_schema(&project.id, "public").await.unwrap();
        assert!(created);

        let (second, created) = catalog.ensure_schema(&project.id, "public").await.unwrap();
        assert!(!created);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_membership_check() {
        let catalog = make_catalog().await;
        let user = catalog
            .create_user("bob", "bob@example.com", "cafebabe")
            .await
            .unwrap();
        let project = catalog
            .create_project("p", "", "postgresql", "postgresql://u:p@h:5432/d")
            .await
            .unwrap();

        assert!(matches!(
            catalog
                .require_membership(&project.id, &user.id)
                .await
                .unwrap_err(),
            CatalogError::NotAMember
        ));

        catalog.add_member(&project.id, &user.id).await.unwrap();
        catalog
            .require_membership(&project.id, &user.id)
            .await
            .unwrap();
    }
}
