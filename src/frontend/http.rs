use std::net::SocketAddr;
use std::time::Instant;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use warp::{Filter, Reply};

use crate::auth::{generate_token, str_to_hex_hash, Principal};
use crate::config::schema::HttpFrontend;
use crate::connection::{ConnectionDescriptor, Dialect, TargetConnection};
use crate::context::GatewayContext;
use crate::frontend::http_utils::{into_response, ApiError};
use crate::sync::SyncJob;

const DEFAULT_PAGE_LIMIT: i64 = 15;
const MAX_PAGE_LIMIT: i64 = 100;
const DEFAULT_COLUMN_LIMIT: i64 = 100;

#[derive(Debug, Deserialize)]
struct RegisterBody {
    username: String,
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    email: String,
    password: String,
}

#[derive(Debug, Deserialize)]
struct NewProjectBody {
    project_name: String,
    #[serde(default)]
    description: String,
    dialect: String,
    connection_url: String,
}

#[derive(Debug, Deserialize)]
struct QueryBody {
    query: String,
}

#[derive(Debug, Deserialize)]
struct PageParams {
    skip: Option<i64>,
    limit: Option<i64>,
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableParams {
    schema_id: String,
    skip: Option<i64>,
    limit: Option<i64>,
    search: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ColumnParams {
    table_id: String,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct DataParams {
    schema: String,
    table: String,
    skip: Option<i64>,
    limit: Option<i64>,
}

fn with_context(
    context: GatewayContext,
) -> impl Filter<Extract = (GatewayContext,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || context.clone())
}

fn bearer_token() -> impl Filter<Extract = (Option<String>,), Error = warp::Rejection> + Clone
{
    warp::header::optional::<String>("authorization")
}

fn page_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(DEFAULT_PAGE_LIMIT).clamp(1, MAX_PAGE_LIMIT)
}

fn page_number(skip: i64, limit: i64) -> i64 {
    skip / limit + 1
}

/// Resolve a bearer token into the session's principal.
async fn authorize(
    context: &GatewayContext,
    header: Option<String>,
) -> Result<Principal, ApiError> {
    let header = header.ok_or(ApiError::Unauthorized)?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or(ApiError::Unauthorized)?;

    let session = context.catalog.get_session(token).await?;
    Ok(Principal {
        user_id: session.user_id,
        project_id: session.project_id,
    })
}

/// Metadata and data endpoints only work with a project-scoped token.
fn require_project(principal: &Principal) -> Result<&str, ApiError> {
    principal.project_id.as_deref().ok_or(ApiError::Forbidden)
}

// POST /register
async fn register_user(
    context: GatewayContext,
    body: RegisterBody,
) -> Result<impl Reply, ApiError> {
    let user = context
        .catalog
        .create_user(&body.username, &body.email, &str_to_hex_hash(&body.password))
        .await?;

    info!(username = %user.username, "Registered user");
    Ok(warp::reply::json(&user))
}

// POST /token
async fn issue_token(
    context: GatewayContext,
    body: TokenBody,
) -> Result<impl Reply, ApiError> {
    let user = context.catalog.get_user_by_email(&body.email).await?;

    if user.disabled || user.password_hash != str_to_hex_hash(&body.password) {
        return Err(ApiError::Unauthorized);
    }

    let token = generate_token();
    let expires_at = Utc::now().timestamp() + context.session_ttl_seconds();
    context
        .catalog
        .create_session(&token, &user.id, None, expires_at)
        .await?;

    Ok(warp::reply::json(&json!({
        "access_token": token,
        "token_type": "bearer",
    })))
}

// GET /projects
async fn list_projects(
    context: GatewayContext,
    auth: Option<String>,
) -> Result<impl Reply, ApiError> {
    let principal = authorize(&context, auth).await?;
    let projects = context.catalog.list_projects(&principal.user_id).await?;
    Ok(warp::reply::json(&projects))
}

// POST /project/new
async fn new_project(
    context: GatewayContext,
    auth: Option<String>,
    body: NewProjectBody,
) -> Result<impl Reply, ApiError> {
    let principal = authorize(&context, auth).await?;

    // The declared dialect wins over the URL scheme
    let dialect: Dialect = body.dialect.parse()?;
    let mut descriptor = ConnectionDescriptor::parse(&body.connection_url)?;
    descriptor.dialect = dialect;
    let url = descriptor.build_url()?;

    // Probe the target before persisting anything
    let mut conn = TargetConnection::new(descriptor);
    conn.connect().await?;
    conn.close().await?;

    let project = context
        .catalog
        .create_project(&body.project_name, &body.description, &dialect.to_string(), &url)
        .await?;
    context
        .catalog
        .add_member(&project.id, &principal.user_id)
        .await?;

    // The queue can be full; the project still exists and the client is
    // told the sync was not scheduled
    let sync_scheduled = context.sync.submit(SyncJob {
        project_id: project.id.clone(),
        connection_url: url,
    });

    info!(project_id = %project.id, sync_scheduled, "Registered project");
    let mut body = serde_json::to_value(&project)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    if let serde_json::Value::Object(fields) = &mut body {
        fields.insert("sync_scheduled".to_string(), json!(sync_scheduled));
    }
    Ok(warp::reply::json(&body))
}

// GET /project/select/:id
async fn select_project(
    project_id: String,
    context: GatewayContext,
    auth: Option<String>,
) -> Result<impl Reply, ApiError> {
    let principal = authorize(&context, auth).await?;

    context.catalog.get_project(&project_id).await?;
    context
        .catalog
        .require_membership(&project_id, &principal.user_id)
        .await?;

    let token = generate_token();
    let expires_at = Utc::now().timestamp() + context.session_ttl_seconds();
    context
        .catalog
        .create_session(&token, &principal.user_id, Some(&project_id), expires_at)
        .await?;

    Ok(warp::reply::json(&json!({
        "access_token": token,
        "token_type": "bearer",
    })))
}

// GET /schemas
async fn list_schemas(
    context: GatewayContext,
    auth: Option<String>,
    params: PageParams,
) -> Result<impl Reply, ApiError> {
    let principal = authorize(&context, auth).await?;
    let project_id = require_project(&principal)?;

    let limit = page_limit(params.limit);
    let skip = params.skip.unwrap_or(0).max(0);
    let (schemas, total) = context
        .catalog
        .list_schemas(project_id, params.search.as_deref(), limit, skip)
        .await?;

    Ok(warp::reply::json(&json!({
        "data": schemas,
        "total": total,
        "page": page_number(skip, limit),
        "limit": limit,
    })))
}

// GET /tables
async fn list_tables(
    context: GatewayContext,
    auth: Option<String>,
    params: TableParams,
) -> Result<impl Reply, ApiError> {
    let principal = authorize(&context, auth).await?;
    let project_id = require_project(&principal)?;

    let schema = context.catalog.get_schema_by_id(&params.schema_id).await?;
    if schema.project_id != project_id {
        return Err(ApiError::NotFound(format!(
            "Schema {:?} doesn't exist",
            params.schema_id
        )));
    }

    let limit = page_limit(params.limit);
    let skip = params.skip.unwrap_or(0).max(0);
    let (tables, total) = context
        .catalog
        .list_tables(&schema.id, params.search.as_deref(), limit, skip)
        .await?;

    Ok(warp::reply::json(&json!({
        "data": tables,
        "total": total,
        "page": page_number(skip, limit),
        "limit": limit,
    })))
}

// GET /columns
async fn list_columns(
    context: GatewayContext,
    auth: Option<String>,
    params: ColumnParams,
) -> Result<impl Reply, ApiError> {
    let principal = authorize(&context, auth).await?;
    let project_id = require_project(&principal)?;

    let table = context.catalog.get_table_by_id(&params.table_id).await?;
    let schema = context.catalog.get_schema_by_id(&table.schema_id).await?;
    if schema.project_id != project_id {
        return Err(ApiError::NotFound(format!(
            "Table {:?} doesn't exist",
            params.table_id
        )));
    }

    let limit = params.limit.unwrap_or(DEFAULT_COLUMN_LIMIT).max(1);
    let (columns, total) = context.catalog.list_columns(&table.id, limit).await?;

    Ok(warp::reply::json(&json!({
        "data": columns,
        "total": total,
        "limit": limit,
    })))
}

// GET /data
async fn read_data(
    context: GatewayContext,
    auth: Option<String>,
    params: DataParams,
) -> Result<impl Reply, ApiError> {
    let principal = authorize(&context, auth).await?;
    let project_id = require_project(&principal)?;

    let schema = context.catalog.get_schema_by_id(&params.schema).await?;
    if schema.project_id != project_id {
        return Err(ApiError::NotFound(format!(
            "Schema {:?} doesn't exist",
            params.schema
        )));
    }
    // Only tables the synchronizer has catalogued are readable
    let table = context.catalog.get_table(&schema.id, &params.table).await?;

    let project = context.catalog.get_project(project_id).await?;

    let limit = page_limit(params.limit);
    let skip = params.skip.unwrap_or(0).max(0);

    let started = Instant::now();
    // The reflected structure is cached per (url, schema, table); this also
    // fails early if the table has vanished from the target
    let handle = context
        .engines
        .get_table_handle(&project.connection_url, &schema.schema_name, &table.table_name)
        .await?;
    let conn = context.engines.get_connection(&project.connection_url).await?;
    let (rows, total) = conn
        .fetch_rows(&schema.schema_name, &table.table_name, limit, skip)
        .await?;
    let time_taken = started.elapsed().as_secs_f64();

    debug!(
        schema = %schema.schema_name,
        table = %table.table_name,
        rows = rows.len(),
        time_taken,
        "Fetched rows"
    );

    Ok(warp::reply::json(&json!({
        "data": rows,
        "columns": handle.columns,
        "total": total,
        "page": page_number(skip, limit),
        "limit": limit,
        "time_taken": time_taken,
    })))
}

// POST /query/execute
async fn execute_query(
    context: GatewayContext,
    auth: Option<String>,
    body: QueryBody,
) -> Result<impl Reply, ApiError> {
    let principal = authorize(&context, auth).await?;
    let project_id = require_project(&principal)?;

    let project = context.catalog.get_project(project_id).await?;

    let started = Instant::now();
    let conn = context.engines.get_connection(&project.connection_url).await?;
    let output = conn.execute_sql(&body.query).await?;
    let time_taken = started.elapsed().as_secs_f64();

    Ok(warp::reply::json(&json!({
        "result": output,
        "time_taken": time_taken,
    })))
}

pub fn filters(
    context: GatewayContext,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["Authorization", "Content-Type"])
        .allow_methods(vec!["GET", "POST"]);

    let health = warp::path::end()
        .and(warp::get())
        .map(|| "Server is running");

    let register = warp::path!("register")
        .and(warp::post())
        .and(with_context(context.clone()))
        .and(warp::body::json())
        .then(register_user)
        .map(into_response);

    let token = warp::path!("token")
        .and(warp::post())
        .and(with_context(context.clone()))
        .and(warp::body::json())
        .then(issue_token)
        .map(into_response);

    let projects = warp::path!("projects")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and(bearer_token())
        .then(list_projects)
        .map(into_response);

    let project_new = warp::path!("project" / "new")
        .and(warp::post())
        .and(with_context(context.clone()))
        .and(bearer_token())
        .and(warp::body::json())
        .then(new_project)
        .map(into_response);

    let project_select = warp::path!("project" / "select" / String)
        .and(warp::get())
        .and(with_context(context.clone()))
        .and(bearer_token())
        .then(select_project)
        .map(into_response);

    let schemas = warp::path!("schemas")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and(bearer_token())
        .and(warp::query::<PageParams>())
        .then(list_schemas)
        .map(into_response);

    let tables = warp::path!("tables")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and(bearer_token())
        .and(warp::query::<TableParams>())
        .then(list_tables)
        .map(into_response);

    let columns = warp::path!("columns")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and(bearer_token())
        .and(warp::query::<ColumnParams>())
        .then(list_columns)
        .map(into_response);

    let data = warp::path!("data")
        .and(warp::get())
        .and(with_context(context.clone()))
        .and(bearer_token())
        .and(warp::query::<DataParams>())
        .then(read_data)
        .map(into_response);

    let query = warp::path!("query" / "execute")
        .and(warp::post())
        .and(with_context(context))
        .and(bearer_token())
        .and(warp::body::json())
        .then(execute_query)
        .map(into_response);

    health
        .or(register)
        .or(token)
        .or(projects)
        .or(project_new)
        .or(project_select)
        .or(schemas)
        .or(tables)
        .or(columns)
        .or(data)
        .or(query)
        .with(cors)
}

pub async fn run_server(context: GatewayContext, config: HttpFrontend) {
    let filters = filters(context);

    let socket_addr: SocketAddr = format!("{}:{}", config.bind_host, config.bind_port)
        .parse()
        .expect("Error parsing the listen address");
    warp::serve(filters).run(socket_addr).await;
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use warp::hyper::StatusCode;
    use warp::test::request;

    use super::filters;
    use crate::config::context::build_context;
    use crate::config::schema::{self, SkimmerConfig};
    use crate::context::GatewayContext;

    async fn in_memory_context() -> GatewayContext {
        let config = SkimmerConfig {
            catalog: schema::Catalog::Sqlite(schema::Sqlite {
                dsn: "sqlite::memory:".to_string(),
            }),
            frontend: Default::default(),
            sync: Default::default(),
            cache: Default::default(),
            auth: Default::default(),
        };
        build_context(config).await
    }

    async fn register_and_login(context: &GatewayContext) -> String {
        let resp = request()
            .method("POST")
            .path("/register")
            .json(&json!({
                "username": "alice",
                "email": "alice@example.com",
                "password": "hunter2",
            }))
            .reply(&filters(context.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = request()
            .method("POST")
            .path("/token")
            .json(&json!({"email": "alice@example.com", "password": "hunter2"}))
            .reply(&filters(context.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        body["access_token"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let context = in_memory_context().await;
        let resp = request().path("/").reply(&filters(context)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body(), "Server is running");
    }

    #[tokio::test]
    async fn test_register_duplicate_conflict() {
        let context = in_memory_context().await;
        register_and_login(&context).await;

        let resp = request()
            .method("POST")
            .path("/register")
            .json(&json!({
                "username": "alice",
                "email": "alice@example.com",
                "password": "hunter2",
            }))
            .reply(&filters(context))
            .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_token_bad_password() {
        let context = in_memory_context().await;
        register_and_login(&context).await;

        let resp = request()
            .method("POST")
            .path("/token")
            .json(&json!({"email": "alice@example.com", "password": "wrong"}))
            .reply(&filters(context))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_token_unknown_user() {
        let context = in_memory_context().await;

        let resp = request()
            .method("POST")
            .path("/token")
            .json(&json!({"email": "nobody@example.com", "password": "x"}))
            .reply(&filters(context))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_projects_requires_auth() {
        let context = in_memory_context().await;

        let resp = request().path("/projects").reply(&filters(context.clone())).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = request()
            .path("/projects")
            .header("Authorization", "Bearer bogus")
            .reply(&filters(context))
            .await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_projects_empty_list() {
        let context = in_memory_context().await;
        let token = register_and_login(&context).await;

        let resp = request()
            .path("/projects")
            .header("Authorization", format!("Bearer {token}"))
            .reply(&filters(context))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_new_project_unsupported_dialect() {
        let context = in_memory_context().await;
        let token = register_and_login(&context).await;

        let resp = request()
            .method("POST")
            .path("/project/new")
            .header("Authorization", format!("Bearer {token}"))
            .json(&json!({
                "project_name": "p",
                "dialect": "oracle",
                "connection_url": "oracle://u:p@h:1521/db",
            }))
            .reply(&filters(context.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        // Nothing was persisted
        let resp = request()
            .path("/projects")
            .header("Authorization", format!("Bearer {token}"))
            .reply(&filters(context))
            .await;
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_new_project_malformed_url() {
        let context = in_memory_context().await;
        let token = register_and_login(&context).await;

        let resp = request()
            .method("POST")
            .path("/project/new")
            .header("Authorization", format!("Bearer {token}"))
            .json(&json!({
                "project_name": "p",
                "dialect": "postgresql",
                "connection_url": "not a url",
            }))
            .reply(&filters(context))
            .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    /// Seed a project, membership and some synced metadata directly through
    /// the catalog, then drive the metadata endpoints over HTTP.
    async fn seed_project(context: &GatewayContext) -> (String, String, String) {
        let user = context
            .catalog
            .get_user_by_email("alice@example.com")
            .await
            .unwrap();
        let project = context
            .catalog
            .create_project("p", "", "postgresql", "postgresql://u:p@h:5432/d")
            .await
            .unwrap();
        context
            .catalog
            .add_member(&project.id, &user.id)
            .await
            .unwrap();

        let (schema, _) = context
            .catalog
            .ensure_schema(&project.id, "public")
            .await
            .unwrap();
        let (table, _) = context
            .catalog
            .ensure_table(&schema.id, "orders", "public")
            .await
            .unwrap();
        for column in ["id", "amount"] {
            context
                .catalog
                .ensure_column(&table.id, &schema.id, column, "orders", "public")
                .await
                .unwrap();
        }

        (project.id, schema.id, table.id)
    }

    #[tokio::test]
    async fn test_metadata_browsing_flow() {
        let context = in_memory_context().await;
        let token = register_and_login(&context).await;
        let (project_id, schema_id, table_id) = seed_project(&context).await;

        // A user-scoped token can't browse metadata
        let resp = request()
            .path("/schemas")
            .header("Authorization", format!("Bearer {token}"))
            .reply(&filters(context.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        // Select the project to get a scoped token
        let resp = request()
            .path(&format!("/project/select/{project_id}"))
            .header("Authorization", format!("Bearer {token}"))
            .reply(&filters(context.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        let project_token = body["access_token"].as_str().unwrap().to_string();

        let resp = request()
            .path("/schemas")
            .header("Authorization", format!("Bearer {project_token}"))
            .reply(&filters(context.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["total"], json!(1));
        assert_eq!(body["page"], json!(1));
        assert_eq!(body["limit"], json!(15));
        assert_eq!(body["data"][0]["schema_name"], json!("public"));

        let resp = request()
            .path(&format!("/tables?schema_id={schema_id}"))
            .header("Authorization", format!("Bearer {project_token}"))
            .reply(&filters(context.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["total"], json!(1));
        assert_eq!(body["data"][0]["table_name"], json!("orders"));

        let resp = request()
            .path(&format!("/columns?table_id={table_id}"))
            .header("Authorization", format!("Bearer {project_token}"))
            .reply(&filters(context.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(resp.body()).unwrap();
        assert_eq!(body["total"], json!(2));

        // Unknown schema is a 404
        let resp = request()
            .path("/tables?schema_id=no-such-schema")
            .header("Authorization", format!("Bearer {project_token}"))
            .reply(&filters(context))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_select_project_requires_membership() {
        let context = in_memory_context().await;
        let token = register_and_login(&context).await;

        // A project the user is not a member of
        let project = context
            .catalog
            .create_project("other", "", "postgresql", "postgresql://u:p@h:5432/d")
            .await
            .unwrap();

        let resp = request()
            .path(&format!("/project/select/{}", project.id))
            .header("Authorization", format!("Bearer {token}"))
            .reply(&filters(context.clone()))
            .await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = request()
            .path("/project/select/no-such-project")
            .header("Authorization", format!("Bearer {token}"))
            .reply(&filters(context))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
