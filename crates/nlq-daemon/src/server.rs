use std::{env, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use crate::accounts::{AccountService, AccountServiceError, Registration};
use crate::middleware::rate_limit::{rate_limit_layer, RateLimitConfig};
use anyhow::{Context, Result};
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use nlq_db::{
    mysql::{DEFAULT_MYSQL_HOST, DEFAULT_MYSQL_PORT},
    password::BCRYPT_COST,
    AccountRecord, CredentialCipher, Database, ExecutionResult, MySqlConnector,
};
use nlq_kernel::{
    completion::{DEFAULT_COMPLETION_TIMEOUT, DEFAULT_GEMINI_ENDPOINT, DEFAULT_GEMINI_MODEL},
    AuditConfig, GeminiClient, GeminiConfig, PipelineConfig, PipelineError, PipelineOutcome,
    QueryPipeline, TranslationRequest, ACCOUNT_NOT_FOUND,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use utoipa::{IntoParams, OpenApi, ToSchema};

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let mut db = Database::connect(&config.accounts_dsn)
        .await
        .context("failed to open account store")?
        .with_password_cost(config.password_cost);
    if let Some(key) = &config.credential_key {
        let cipher = CredentialCipher::new(key).context("invalid NLQ_CREDENTIAL_KEY")?;
        db = db.with_cipher(cipher);
    }

    let connector = Arc::new(MySqlConnector::new(
        config.mysql_host.clone(),
        config.mysql_port,
    ));
    let completion = GeminiClient::new(config.gemini.clone())
        .context("failed to build completion client")?;

    let pipeline = QueryPipeline::new(
        Arc::new(db.clone()),
        Arc::new(completion),
        connector.clone(),
        config.pipeline.clone(),
    );
    let accounts = AccountService::new(db, connector);
    let state = Arc::new(AppState { pipeline, accounts });

    let app = build_app(state, config.rate_limits.clone(), &config.cors_origins);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(
        addr = %config.listen_addr,
        mysql_host = %config.mysql_host,
        mysql_port = config.mysql_port,
        model = %config.gemini.model,
        "nlq-daemon listening"
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("HTTP server exited")?;
    Ok(())
}

/// Routes plus the request middleware. CORS sits outside the limiter so preflights are
/// answered without spending a client's budget.
fn build_app(
    state: Arc<AppState>,
    rate_limits: RateLimitConfig,
    cors_origins: &[HeaderValue],
) -> Router {
    build_router(state)
        .layer(rate_limit_layer(rate_limits))
        .layer(cors_layer(cors_origins))
        .layer(TraceLayer::new_for_http())
}

/// Any origin when the list is empty, otherwise only the listed ones.
fn cors_layer(allowed_origins: &[HeaderValue]) -> CorsLayer {
    let origin = if allowed_origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(allowed_origins.iter().cloned())
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/query", post(run_query))
        .route("/api/v1/accounts", post(register_account))
        .route("/api/v1/accounts/login", post(login))
        .route("/api/v1/accounts/databases", get(list_databases))
        .route("/api/v1/accounts/user", get(get_user))
        .with_state(state)
}

#[derive(Clone)]
struct AppState {
    pipeline: QueryPipeline,
    accounts: AccountService,
}

#[derive(Debug, Clone)]
struct AppConfig {
    listen_addr: SocketAddr,
    accounts_dsn: String,
    mysql_host: String,
    mysql_port: u16,
    gemini: GeminiConfig,
    credential_key: Option<Vec<u8>>,
    password_cost: u32,
    pipeline: PipelineConfig,
    rate_limits: RateLimitConfig,
    cors_origins: Vec<HeaderValue>,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        let listen_addr = env::var("NLQ_API_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid NLQ_API_ADDR")?;

        let accounts_dsn = env::var("NLQ_ACCOUNTS_DSN")
            .or_else(|_| env::var("DATABASE_URL"))
            .unwrap_or_else(|_| "sqlite://./nlq-accounts.db".to_string());

        let mysql_host =
            env::var("NLQ_MYSQL_HOST").unwrap_or_else(|_| DEFAULT_MYSQL_HOST.to_string());
        let mysql_port = match env::var("NLQ_MYSQL_PORT") {
            Ok(value) => value.trim().parse().context("invalid NLQ_MYSQL_PORT")?,
            Err(_) => DEFAULT_MYSQL_PORT,
        };

        let api_key = env::var("GEMINI_API_KEY")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .context("GEMINI_API_KEY must be configured")?;
        let completion_timeout = seconds_env("NLQ_COMPLETION_TIMEOUT_SECONDS")
            .unwrap_or(DEFAULT_COMPLETION_TIMEOUT);
        let gemini = GeminiConfig {
            api_key,
            model: env::var("NLQ_GEMINI_MODEL")
                .unwrap_or_else(|_| DEFAULT_GEMINI_MODEL.to_string()),
            endpoint: env::var("NLQ_GEMINI_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_GEMINI_ENDPOINT.to_string()),
            timeout: completion_timeout,
        };

        let engine_timeout = seconds_env("NLQ_DB_TIMEOUT_SECONDS")
            .unwrap_or(nlq_db::executor::DEFAULT_ENGINE_TIMEOUT);

        let audit = AuditConfig {
            enabled: bool_env("NLQ_AUDIT_LOG_ENABLED").unwrap_or(false),
            log_path: env::var("NLQ_AUDIT_LOG_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./logs/statements.jsonl")),
            hmac_key: base64_env("NLQ_AUDIT_LOG_HMAC_KEY")?,
        };

        let defaults = RateLimitConfig::default();
        let rate_limits = RateLimitConfig {
            query_per_minute: u64_env("NLQ_RATE_LIMIT_QUERY_PER_MINUTE")
                .unwrap_or(defaults.query_per_minute),
            account_per_minute: u64_env("NLQ_RATE_LIMIT_ACCOUNT_PER_MINUTE")
                .unwrap_or(defaults.account_per_minute),
            window: defaults.window,
        };

        Ok(Self {
            listen_addr,
            accounts_dsn,
            mysql_host,
            mysql_port,
            gemini,
            credential_key: base64_env("NLQ_CREDENTIAL_KEY")?,
            password_cost: match env::var("NLQ_BCRYPT_COST") {
                Ok(value) => value.trim().parse().context("invalid NLQ_BCRYPT_COST")?,
                Err(_) => BCRYPT_COST,
            },
            pipeline: PipelineConfig {
                completion_timeout,
                engine_timeout,
                audit,
            },
            rate_limits,
            cors_origins: parse_origins(env::var("NLQ_CORS_ALLOWED_ORIGINS").ok().as_deref())?,
        })
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    post,
    path = "/api/v1/query",
    request_body = QueryBody,
    responses(
        (status = 200, description = "Statement executed, or rejected by the database (success = false)", body = QueryResponse),
        (status = 400, description = "Missing fields", body = ErrorBody),
        (status = 404, description = "Unknown account", body = ErrorBody),
        (status = 503, description = "Completion service unavailable", body = ErrorBody),
        (status = 500, description = "Account store failure", body = ErrorBody)
    )
)]
async fn run_query(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<QueryBody>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let Json(body) = json_body(payload)?;
    let request = TranslationRequest {
        account_id: body.email,
        target_database: body.database_name,
        natural_language_text: body.query,
    };

    match state.pipeline.run(&request).await {
        PipelineOutcome::Success {
            nl_query,
            sql_query,
            result,
        } => Ok(Json(QueryResponse {
            success: true,
            nl_query: Some(nl_query),
            sql_query: Some(sql_query),
            result: Some(result),
            error: None,
        })),
        PipelineOutcome::Failure {
            error, sql_query, ..
        } if error.is_soft() => Ok(Json(QueryResponse {
            success: false,
            nl_query: None,
            sql_query,
            result: None,
            error: Some(error.to_string()),
        })),
        PipelineOutcome::Failure { error, .. } => Err(error.into()),
    }
}

#[utoipa::path(
    post,
    path = "/api/v1/accounts",
    request_body = RegisterBody,
    responses(
        (status = 201, description = "Account registered and database provisioned", body = MessageResponse),
        (status = 400, description = "Missing fields or invalid database name", body = ErrorBody),
        (status = 409, description = "Email already registered", body = ErrorBody),
        (status = 500, description = "Database provisioning failed", body = ErrorBody)
    )
)]
async fn register_account(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<RegisterBody>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let Json(body) = json_body(payload)?;
    state.accounts.register(body.into()).await?;
    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            message: "User registered successfully!".into(),
        }),
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/accounts/login",
    request_body = LoginBody,
    responses(
        (status = 200, description = "Credentials accepted", body = LoginResponse),
        (status = 400, description = "Missing fields", body = ErrorBody),
        (status = 401, description = "Wrong password", body = ErrorBody),
        (status = 404, description = "Unknown account", body = ErrorBody)
    )
)]
async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<LoginBody>, JsonRejection>,
) -> Result<Json<LoginResponse>, ApiError> {
    let Json(body) = json_body(payload)?;
    let record = state
        .accounts
        .login(
            body.email.as_deref().unwrap_or_default(),
            body.password.as_deref().unwrap_or_default(),
        )
        .await?;
    Ok(Json(LoginResponse {
        message: "Login successful!".into(),
        username: record.username,
        databases: record.databases,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/accounts/databases",
    params(EmailQuery),
    responses(
        (status = 200, description = "Databases owned by the account", body = DatabasesResponse),
        (status = 400, description = "Missing email", body = ErrorBody),
        (status = 404, description = "Unknown account", body = ErrorBody)
    )
)]
async fn list_databases(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EmailQuery>,
) -> Result<Json<DatabasesResponse>, ApiError> {
    let databases = state
        .accounts
        .databases(query.email.as_deref().unwrap_or_default())
        .await?;
    Ok(Json(DatabasesResponse {
        success: true,
        databases,
    }))
}

#[utoipa::path(
    get,
    path = "/api/v1/accounts/user",
    params(EmailQuery),
    responses(
        (status = 200, description = "Public account profile", body = UserResponse),
        (status = 400, description = "Missing email", body = ErrorBody),
        (status = 404, description = "Unknown account", body = ErrorBody)
    )
)]
async fn get_user(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EmailQuery>,
) -> Result<Json<UserResponse>, ApiError> {
    let record = state
        .accounts
        .account(query.email.as_deref().unwrap_or_default())
        .await?;
    Ok(Json(UserResponse {
        user: UserProfile::from(record),
    }))
}

fn json_body<T: DeserializeOwned>(
    payload: Result<Json<T>, JsonRejection>,
) -> Result<Json<T>, ApiError> {
    payload.map_err(|rejection| ApiError::bad_request(rejection.body_text()))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
struct QueryBody {
    email: Option<String>,
    database_name: Option<String>,
    /// Natural-language request to translate.
    query: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct QueryResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    nl_query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sql_query: Option<String>,
    /// Row objects for reads, `{message}` for writes.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Object)]
    result: Option<ExecutionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(default, deny_unknown_fields)]
struct RegisterBody {
    username: String,
    email: String,
    password: String,
    mysql_root_user: String,
    mysql_root_password: String,
    database_name: String,
}

impl From<RegisterBody> for Registration {
    fn from(body: RegisterBody) -> Self {
        Registration {
            username: body.username,
            email: body.email,
            password: body.password,
            db_user: body.mysql_root_user,
            db_password: body.mysql_root_password,
            database_name: body.database_name,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
struct LoginBody {
    email: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct EmailQuery {
    email: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct MessageResponse {
    message: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct LoginResponse {
    message: String,
    username: String,
    databases: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct DatabasesResponse {
    success: bool,
    databases: Vec<String>,
}

#[derive(Debug, Serialize, ToSchema)]
struct UserResponse {
    user: UserProfile,
}

#[derive(Debug, Serialize, ToSchema)]
struct UserProfile {
    username: String,
    email: String,
    mysql_root_user: String,
}

impl From<AccountRecord> for UserProfile {
    fn from(record: AccountRecord) -> Self {
        Self {
            username: record.username,
            email: record.email,
            mysql_root_user: record.db_user,
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Validation(message) => ApiError::bad_request(message),
            PipelineError::AccountNotFound => {
                ApiError::new(StatusCode::NOT_FOUND, ACCOUNT_NOT_FOUND)
            }
            PipelineError::AccountStore(inner) => ApiError::internal(inner),
            PipelineError::Translation(inner) => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, inner.to_string())
            }
            PipelineError::Execution(inner) => ApiError::internal(inner),
        }
    }
}

impl From<AccountServiceError> for ApiError {
    fn from(err: AccountServiceError) -> Self {
        let status = match &err {
            AccountServiceError::Invalid(_) => StatusCode::BAD_REQUEST,
            AccountServiceError::Duplicate(_) => StatusCode::CONFLICT,
            AccountServiceError::NotFound => StatusCode::NOT_FOUND,
            AccountServiceError::InvalidPassword => StatusCode::UNAUTHORIZED,
            AccountServiceError::Provisioning(_) | AccountServiceError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        ApiError::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

pub mod docs {
    use super::*;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "NLQ Daemon API", version = "0.1.0"),
        paths(healthz, run_query, register_account, login, list_databases, get_user),
        components(schemas(
            QueryBody,
            QueryResponse,
            RegisterBody,
            LoginBody,
            MessageResponse,
            LoginResponse,
            DatabasesResponse,
            UserResponse,
            UserProfile,
            ErrorBody
        ))
    )]
    pub struct ApiDoc;
}

fn bool_env(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .and_then(|value| match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => None,
        })
}

fn u64_env(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn seconds_env(key: &str) -> Option<Duration> {
    u64_env(key)
        .filter(|seconds| *seconds > 0)
        .map(Duration::from_secs)
}

/// Comma-separated origins. Unset, empty or `*` allows any origin.
fn parse_origins(raw: Option<&str>) -> Result<Vec<HeaderValue>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let origins: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .collect();
    if origins.contains(&"*") {
        return Ok(Vec::new());
    }
    origins
        .into_iter()
        .map(|origin| {
            HeaderValue::from_str(origin)
                .with_context(|| format!("invalid origin '{origin}' in NLQ_CORS_ALLOWED_ORIGINS"))
        })
        .collect()
}

fn base64_env(key: &str) -> Result<Option<Vec<u8>>> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => STANDARD
            .decode(value.trim())
            .map(Some)
            .with_context(|| format!("invalid base64 in {key}")),
        _ => Ok(None),
    }
}
