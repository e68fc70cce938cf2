/// Default implementation for a Repository that factors out common
/// query patterns / SQL queries between Postgres and SQLite.
///
/// Usage:
///
/// The struct has to have certain fields, since this macro relies on them:
///
/// ```ignore
/// pub struct MyRepository {
///     pub executor: sqlx::Pool<sqlx::SqlxDatabaseType>
/// }
///
/// impl MyRepository {
///     pub const MIGRATOR: sqlx::Migrator = sqlx::migrate!("my/migrations");
///     pub const QUERIES: RepositoryQueries = RepositoryQueries {
///         now: "...",
///     }
///     pub fn interpret_error(error: sqlx::Error) -> Error {
///         // Interpret the database-specific error code and turn some sqlx errors
///         // into the Error enum values like UniqueConstraintViolation/FKConstraintViolation
///         // ...
///     }
/// }
///
/// implement_repository!(SqliteRepository)
/// ```
///
/// Both backends accept `$1`-style placeholders and `ON CONFLICT ... DO
/// NOTHING RETURNING`, so the shared bodies below stay identical; only the
/// epoch-now expression differs.

/// Queries that are different between SQLite and PG
pub struct RepositoryQueries {
    /// Expression evaluating to the current Unix epoch second.
    pub now: &'static str,
}

/// Escape LIKE metacharacters so user-supplied search terms match literally.
pub fn escape_like(pattern: &str) -> String {
    pattern
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[macro_export]
macro_rules! implement_repository {
    ($repo: ident) => {
#[async_trait]
impl Repository for $repo {
    async fn setup(&self) {
        $repo::MIGRATOR
            .run(&self.executor)
            .await
            .expect("error running migrations");
    }

    async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<UserRecord, Error> {
        let user = sqlx::query_as(
            r#"
        INSERT INTO "user" (id, username, email, password_hash)
        VALUES ($1, $2, $3, $4)
        RETURNING id, username, email, password_hash, disabled, created_at, updated_at
        "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(username)
        .bind(email)
        .bind(password_hash)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(user)
    }

    async fn get_user_by_email(&self, email: &str) -> Result<UserRecord, Error> {
        let user = sqlx::query_as(
            r#"SELECT id, username, email, password_hash, disabled, created_at, updated_at
            FROM "user" WHERE email = $1"#,
        )
        .bind(email)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(user)
    }

    async fn create_session(
        &self,
        token: &str,
        user_id: &str,
        project_id: Option<&str>,
        expires_at: Timestamp,
    ) -> Result<SessionRecord, Error> {
        let session = sqlx::query_as(
            r#"
        INSERT INTO session (token, user_id, project_id, expires_at)
        VALUES ($1, $2, $3, $4)
        RETURNING token, user_id, project_id, expires_at
        "#,
        )
        .bind(token)
        .bind(user_id)
        .bind(project_id)
        .bind(expires_at)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(session)
    }

    async fn get_session(&self, token: &str) -> Result<SessionRecord, Error> {
        // Expiry is evaluated against the metadata store's clock, not the
        // gateway's
        let query = format!(
            "SELECT token, user_id, project_id, expires_at FROM session \
            WHERE token = $1 AND expires_at > {}",
            $repo::QUERIES.now
        );
        let session = sqlx::query_as(&query)
            .bind(token)
            .fetch_one(&self.executor)
            .await.map_err($repo::interpret_error)?;

        Ok(session)
    }

    async fn create_project(
        &self,
        project_name: &str,
        description: &str,
        dialect: &str,
        connection_url: &str,
    ) -> Result<ProjectRecord, Error> {
        let project = sqlx::query_as(
            r#"
        INSERT INTO project (id, project_name, description, dialect, connection_url)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, project_name, description, dialect, connection_url, created_at, updated_at
        "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_name)
        .bind(description)
        .bind(dialect)
        .bind(connection_url)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(project)
    }

    async fn get_project(&self, project_id: &str) -> Result<ProjectRecord, Error> {
        let project = sqlx::query_as(
            r#"SELECT id, project_name, description, dialect, connection_url, created_at, updated_at
            FROM project WHERE id = $1"#,
        )
        .bind(project_id)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(project)
    }

    async fn create_membership(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<MembershipRecord, Error> {
        let membership = sqlx::query_as(
            r#"
        INSERT INTO project_member (id, project_id, user_id)
        VALUES ($1, $2, $3)
        RETURNING id, project_id, user_id, created_at, updated_at
        "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id)
        .bind(user_id)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(membership)
    }

    async fn get_membership(
        &self,
        project_id: &str,
        user_id: &str,
    ) -> Result<MembershipRecord, Error> {
        let membership = sqlx::query_as(
            r#"SELECT id, project_id, user_id, created_at, updated_at
            FROM project_member WHERE project_id = $1 AND user_id = $2"#,
        )
        .bind(project_id)
        .bind(user_id)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(membership)
    }

    async fn list_memberships(
        &self,
        user_id: &str,
    ) -> Result<Vec<MembershipProjectResult>, Error> {
        let memberships = sqlx::query_as(
            r#"
        SELECT
            project.id AS project_id,
            project.project_name,
            project.description,
            project.dialect,
            project.created_at,
            project.updated_at
        FROM project_member
        JOIN project ON project_member.project_id = project.id
        WHERE project_member.user_id = $1
        ORDER BY project.created_at, project.id
        "#,
        )
        .bind(user_id)
        .fetch_all(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(memberships)
    }

    async fn create_schema(
        &self,
        project_id: &str,
        schema_name: &str,
    ) -> Result<Option<SchemaRecord>, Error> {
        let schema = sqlx::query_as(
            r#"
        INSERT INTO schema_metadata (id, project_id, schema_name)
        VALUES ($1, $2, $3)
        ON CONFLICT (project_id, schema_name) DO NOTHING
        RETURNING id, project_id, schema_name, created_at, updated_at
        "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id)
        .bind(schema_name)
        .fetch_optional(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(schema)
    }

    async fn get_schema(
        &self,
        project_id: &str,
        schema_name: &str,
    ) -> Result<SchemaRecord, Error> {
        let schema = sqlx::query_as(
            r#"SELECT id, project_id, schema_name, created_at, updated_at
            FROM schema_metadata WHERE project_id = $1 AND schema_name = $2"#,
        )
        .bind(project_id)
        .bind(schema_name)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(schema)
    }

    async fn get_schema_by_id(&self, schema_id: &str) -> Result<SchemaRecord, Error> {
        let schema = sqlx::query_as(
            r#"SELECT id, project_id, schema_name, created_at, updated_at
            FROM schema_metadata WHERE id = $1"#,
        )
        .bind(schema_id)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(schema)
    }

    async fn list_schemas(
        &self,
        project_id: &str,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SchemaRecord>, Error> {
        let mut builder: QueryBuilder<_> = QueryBuilder::new(
            "SELECT id, project_id, schema_name, created_at, updated_at \
            FROM schema_metadata WHERE project_id = ",
        );
        builder.push_bind(project_id);

        if let Some(search) = search {
            builder.push(" AND schema_name LIKE ");
            builder.push_bind(format!(
                "%{}%",
                $crate::repository::default::escape_like(search)
            ));
            builder.push(" ESCAPE '\\'");
        }

        builder.push(" ORDER BY schema_name LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let schemas = builder
            .build_query_as()
            .fetch(&self.executor)
            .try_collect()
            .await
            .map_err($repo::interpret_error)?;

        Ok(schemas)
    }

    async fn count_schemas(
        &self,
        project_id: &str,
        search: Option<&str>,
    ) -> Result<i64, Error> {
        let mut builder: QueryBuilder<_> =
            QueryBuilder::new("SELECT COUNT(*) FROM schema_metadata WHERE project_id = ");
        builder.push_bind(project_id);

        if let Some(search) = search {
            builder.push(" AND schema_name LIKE ");
            builder.push_bind(format!(
                "%{}%",
                $crate::repository::default::escape_like(search)
            ));
            builder.push(" ESCAPE '\\'");
        }

        let count = builder
            .build()
            .fetch_one(&self.executor)
            .await.map_err($repo::interpret_error)?
            .try_get(0).map_err($repo::interpret_error)?;

        Ok(count)
    }

    async fn create_table(
        &self,
        schema_id: &str,
        table_name: &str,
        schema_name: &str,
    ) -> Result<Option<TableRecord>, Error> {
        let table = sqlx::query_as(
            r#"
        INSERT INTO table_metadata (id, schema_id, table_name, schema_name)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (schema_id, table_name) DO NOTHING
        RETURNING id, schema_id, table_name, schema_name, created_at, updated_at
        "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(schema_id)
        .bind(table_name)
        .bind(schema_name)
        .fetch_optional(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(table)
    }

    async fn get_table(
        &self,
        schema_id: &str,
        table_name: &str,
    ) -> Result<TableRecord, Error> {
        let table = sqlx::query_as(
            r#"SELECT id, schema_id, table_name, schema_name, created_at, updated_at
            FROM table_metadata WHERE schema_id = $1 AND table_name = $2"#,
        )
        .bind(schema_id)
        .bind(table_name)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(table)
    }

    async fn get_table_by_id(&self, table_id: &str) -> Result<TableRecord, Error> {
        let table = sqlx::query_as(
            r#"SELECT id, schema_id, table_name, schema_name, created_at, updated_at
            FROM table_metadata WHERE id = $1"#,
        )
        .bind(table_id)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(table)
    }

    async fn list_tables(
        &self,
        schema_id: &str,
        search: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<TableRecord>, Error> {
        let mut builder: QueryBuilder<_> = QueryBuilder::new(
            "SELECT id, schema_id, table_name, schema_name, created_at, updated_at \
            FROM table_metadata WHERE schema_id = ",
        );
        builder.push_bind(schema_id);

        if let Some(search) = search {
            builder.push(" AND table_name LIKE ");
            builder.push_bind(format!(
                "%{}%",
                $crate::repository::default::escape_like(search)
            ));
            builder.push(" ESCAPE '\\'");
        }

        builder.push(" ORDER BY table_name LIMIT ");
        builder.push_bind(limit);
        builder.push(" OFFSET ");
        builder.push_bind(offset);

        let tables = builder
            .build_query_as()
            .fetch(&self.executor)
            .try_collect()
            .await
            .map_err($repo::interpret_error)?;

        Ok(tables)
    }

    async fn count_tables(
        &self,
        schema_id: &str,
        search: Option<&str>,
    ) -> Result<i64, Error> {
        let mut builder: QueryBuilder<_> =
            QueryBuilder::new("SELECT COUNT(*) FROM table_metadata WHERE schema_id = ");
        builder.push_bind(schema_id);

        if let Some(search) = search {
            builder.push(" AND table_name LIKE ");
            builder.push_bind(format!(
                "%{}%",
                $crate::repository::default::escape_like(search)
            ));
            builder.push(" ESCAPE '\\'");
        }

        let count = builder
            .build()
            .fetch_one(&self.executor)
            .await.map_err($repo::interpret_error)?
            .try_get(0).map_err($repo::interpret_error)?;

        Ok(count)
    }

    async fn create_column(
        &self,
        table_id: &str,
        schema_id: &str,
        column_name: &str,
        table_name: &str,
        schema_name: &str,
    ) -> Result<Option<ColumnRecord>, Error> {
        let column = sqlx::query_as(
            r#"
        INSERT INTO column_metadata (id, table_id, schema_id, column_name, table_name, schema_name)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (table_id, column_name) DO NOTHING
        RETURNING id, table_id, schema_id, column_name, table_name, schema_name, created_at, updated_at
        "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(table_id)
        .bind(schema_id)
        .bind(column_name)
        .bind(table_name)
        .bind(schema_name)
        .fetch_optional(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(column)
    }

    async fn get_column(
        &self,
        table_id: &str,
        column_name: &str,
    ) -> Result<ColumnRecord, Error> {
        let column = sqlx::query_as(
            r#"SELECT id, table_id, schema_id, column_name, table_name, schema_name, created_at, updated_at
            FROM column_metadata WHERE table_id = $1 AND column_name = $2"#,
        )
        .bind(table_id)
        .bind(column_name)
        .fetch_one(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(column)
    }

    async fn list_columns(
        &self,
        table_id: &str,
        limit: i64,
    ) -> Result<Vec<ColumnRecord>, Error> {
        let columns = sqlx::query_as(
            r#"SELECT id, table_id, schema_id, column_name, table_name, schema_name, created_at, updated_at
            FROM column_metadata WHERE table_id = $1
            ORDER BY column_name LIMIT $2"#,
        )
        .bind(table_id)
        .bind(limit)
        .fetch_all(&self.executor)
        .await.map_err($repo::interpret_error)?;

        Ok(columns)
    }

    async fn count_columns(&self, table_id: &str) -> Result<i64, Error> {
        let count = sqlx::query("SELECT COUNT(*) FROM column_metadata WHERE table_id = $1")
            .bind(table_id)
            .fetch_one(&self.executor)
            .await.map_err($repo::interpret_error)?
            .try_get(0).map_err($repo::interpret_error)?;

        Ok(count)
    }
}

};
}

#[cfg(test)]
mod tests {
    use super::escape_like;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("orders"), "orders");
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("a_b"), "a\\_b");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
    }
}
