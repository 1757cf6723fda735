//! ProxyVault API - HTTP API for the ProxyVault proxy pool manager
//!
//! Every success response wraps its payload as `{"data": ..}`, list responses
//! add `total`, failures answer `{"error": ".."}` with a non-2xx status.

use std::net::SocketAddr;

use axum::{
    extract::{
        multipart::Multipart,
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use proxyvault_core::logs::LogStream;
use proxyvault_core::{
    codec, BatchSummary, Error, FailureStats, ImportReport, LogEntry, LogPayload, LogQuery,
    Orchestrator, PageRequest, PayloadFilter, Proxy,
    ProxyFilter, ProxyId, ProxyPatch, ProxySpec, ServerSettings, Settings, VisitLog, VisitSample,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// 导出全部时的文件名
pub const EXPORT_ALL_FILENAME: &str = "proxies.txt";
/// 导出选中代理时的文件名
pub const EXPORT_SELECTED_FILENAME: &str = "selected_proxies.txt";

/// 成功响应
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Json<Self> {
        Json(Self { data, total: None })
    }

    pub fn page(data: T, total: usize) -> Json<Self> {
        Json(Self {
            data,
            total: Some(total),
        })
    }
}

/// 错误响应
#[derive(Debug)]
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

/// 错误类型对应的HTTP状态码
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::Validation(_) => StatusCode::BAD_REQUEST,
        Error::Duplicate(_) | Error::Conflict(_) => StatusCode::CONFLICT,
        Error::NotFound(_) => StatusCode::NOT_FOUND,
        Error::Network(_) => StatusCode::BAD_GATEWAY,
        Error::Storage(_)
        | Error::Configuration(_)
        | Error::Serialization(_)
        | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            warn!(error = %self.0, "请求处理失败");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

/// API状态
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }
}

/// 创建路由
pub fn router(state: AppState, enable_cors: bool) -> Router {
    let api = Router::new()
        .route("/", get(|| async { "ProxyVault API Server" }))
        .route("/api/proxy", get(list_proxies).post(create_proxy))
        .route("/api/proxy/verify-batch", post(verify_batch))
        .route(
            "/api/proxy/:id",
            get(get_proxy).put(update_proxy).delete(delete_proxy),
        )
        .route("/api/proxy/:id/verify", get(verify_proxy))
        .route("/api/import", post(import_proxies))
        .route("/api/export/all", get(export_all))
        .route("/api/export/selected", get(export_selected))
        .route("/api/speedLogs", get(speed_logs))
        .route("/api/ipLogs", get(ip_logs))
        .route("/api/proxyVisits", get(visit_logs).post(record_visit))
        .route("/api/failureLogs", get(failure_logs))
        .route("/api/failureStats/:id", get(failure_stats))
        .route("/api/settings", get(get_settings).put(put_settings))
        .with_state(state);

    let app = api.layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));
    if enable_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// API服务器
pub struct ApiServer {
    config: ServerSettings,
    state: AppState,
}

impl ApiServer {
    /// 创建新的API服务器
    pub fn new(orchestrator: Orchestrator, config: ServerSettings) -> Self {
        Self {
            config,
            state: AppState::new(orchestrator),
        }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone(), self.config.enable_cors)
    }

    /// 运行API服务器直到收到关闭信号
    pub async fn run_with_shutdown(&self, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.bind_port);
        let socket_addr: SocketAddr = addr.parse()?;

        info!("API服务器启动在: {}", addr);
        axum::Server::bind(&socket_addr)
            .serve(self.router().into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
            })
            .await?;

        info!("API服务器已停止");
        Ok(())
    }
}

fn parse_id(raw: &str) -> ApiResult<ProxyId> {
    raw.trim()
        .parse::<ProxyId>()
        .map_err(|_| Error::Validation(format!("invalid proxy id: {}", raw)).into())
}

/// 逗号分隔的ID列表
fn parse_ids(raw: Option<&str>) -> ApiResult<Vec<ProxyId>> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(parse_id)
        .collect()
}

fn json_body<T: DeserializeOwned>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    Ok(body?.0)
}

#[derive(Debug, Default, Deserialize)]
struct ListParams {
    state: Option<String>,
    search: Option<String>,
    sort: Option<String>,
    desc: Option<bool>,
    offset: Option<usize>,
    limit: Option<usize>,
}

impl ListParams {
    fn into_filter(self) -> ApiResult<(ProxyFilter, PageRequest)> {
        let filter = ProxyFilter {
            state: self.state.as_deref().map(str::parse).transpose()?,
            search: self.search.filter(|s| !s.trim().is_empty()),
            sort: self.sort.as_deref().map(str::parse).transpose()?,
            descending: self.desc.unwrap_or(false),
        };
        let defaults = PageRequest::default();
        let page = PageRequest::new(
            self.offset.unwrap_or(defaults.offset),
            self.limit.unwrap_or(defaults.limit),
        );
        Ok((filter, page))
    }
}

async fn list_proxies(
    State(state): State<AppState>,
    params: Result<Query<ListParams>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<Vec<Proxy>>>> {
    let (filter, page) = params?.0.into_filter()?;
    let page = state.orchestrator.store().list(&filter, page).await;
    Ok(ApiResponse::page(page.items, page.total))
}

async fn get_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Proxy>>> {
    let proxy = state.orchestrator.store().get(parse_id(&id)?).await?;
    Ok(ApiResponse::new(proxy))
}

async fn create_proxy(
    State(state): State<AppState>,
    body: Result<Json<ProxySpec>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<Proxy>>> {
    let proxy = state.orchestrator.store().create(json_body(body)?).await?;
    Ok(ApiResponse::new(proxy))
}

async fn update_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<ProxyPatch>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<Proxy>>> {
    let id = parse_id(&id)?;
    let proxy = state.orchestrator.store().update(id, json_body(body)?).await?;
    Ok(ApiResponse::new(proxy))
}

async fn delete_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<&'static str>>> {
    state.orchestrator.store().delete(parse_id(&id)?).await?;
    Ok(ApiResponse::new("Proxy deleted"))
}

async fn verify_proxy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ApiResponse<Proxy>>> {
    let proxy = state.orchestrator.verify_proxy(parse_id(&id)?).await?;
    Ok(ApiResponse::new(proxy))
}

#[derive(Debug, Deserialize)]
struct BatchParams {
    ids: Option<String>,
    concurrency: Option<usize>,
}

async fn verify_batch(
    State(state): State<AppState>,
    params: Result<Query<BatchParams>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<BatchSummary>>> {
    let params = params?.0;
    let ids = parse_ids(params.ids.as_deref())?;
    let summary = state
        .orchestrator
        .verify_batch(&ids, params.concurrency)
        .await?;
    Ok(ApiResponse::new(summary))
}

async fn import_proxies(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> ApiResult<Json<ApiResponse<ImportReport>>> {
    let invalid = |e: &dyn std::fmt::Display| Error::Validation(format!("invalid upload: {}", e));
    let mut raw = None;
    while let Some(field) = multipart.next_field().await.map_err(|e| invalid(&e))? {
        if field.name() == Some("file") {
            raw = Some(field.text().await.map_err(|e| invalid(&e))?);
            break;
        }
    }
    let raw = raw.ok_or_else(|| Error::Validation("missing multipart field 'file'".to_string()))?;

    let default_kind = state.orchestrator.settings().current().await.default_kind;
    let parsed = codec::parse(&raw, default_kind);
    let report = state.orchestrator.store().import(parsed).await;
    Ok(ApiResponse::new(report))
}

fn attachment(filename: &str, body: String) -> Response {
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        body,
    )
        .into_response()
}

async fn export_all(State(state): State<AppState>) -> ApiResult<Response> {
    let proxies = state.orchestrator.store().all().await;
    let text = codec::serialize(&proxies)?;
    info!(count = proxies.len(), "导出全部代理");
    Ok(attachment(EXPORT_ALL_FILENAME, text))
}

#[derive(Debug, Deserialize)]
struct SelectedParams {
    ids: Option<String>,
}

async fn export_selected(
    State(state): State<AppState>,
    params: Result<Query<SelectedParams>, QueryRejection>,
) -> ApiResult<Response> {
    let ids = parse_ids(params?.0.ids.as_deref())?;
    if ids.is_empty() {
        return Err(Error::Validation("no proxy ids given".to_string()).into());
    }
    let proxies = state.orchestrator.store().get_many(&ids).await?;
    let text = codec::serialize(&proxies)?;
    Ok(attachment(EXPORT_SELECTED_FILENAME, text))
}

#[derive(Debug, Default, Deserialize)]
struct LogParams {
    proxy_id: Option<String>,
    start_date: Option<String>,
    end_date: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
    order: Option<String>,
    source_ip: Option<String>,
    target_ip: Option<String>,
    domain: Option<String>,
    error_type: Option<String>,
}

/// RFC 3339 时间或 YYYY-MM-DD 日期。日期作为结束边界时包含当天
fn parse_bound(raw: &str, end_of_day: bool) -> ApiResult<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    let invalid = || ApiError::from(Error::Validation(format!("invalid date: {}", raw)));
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| invalid())?;
    let time = if end_of_day {
        date.and_hms_milli_opt(23, 59, 59, 999)
    } else {
        date.and_hms_opt(0, 0, 0)
    };
    time.map(|t| t.and_utc()).ok_or_else(invalid)
}

impl LogParams {
    fn into_query(self) -> ApiResult<LogQuery> {
        let defaults = LogQuery::default();
        Ok(LogQuery {
            proxy_id: self.proxy_id.as_deref().map(parse_id).transpose()?,
            start: self
                .start_date
                .as_deref()
                .map(|raw| parse_bound(raw, false))
                .transpose()?,
            end: self
                .end_date
                .as_deref()
                .map(|raw| parse_bound(raw, true))
                .transpose()?,
            order: self.order.as_deref().map(str::parse).transpose()?.unwrap_or_default(),
            page: self.page.unwrap_or(defaults.page),
            page_size: self.page_size.unwrap_or(defaults.page_size),
            payload: PayloadFilter {
                failure_kind: self.error_type.as_deref().map(str::parse).transpose()?,
                source_ip: self.source_ip,
                target_ip: self.target_ip,
                domain: self.domain,
            },
        })
    }
}

async fn query_stream<T: LogPayload + Serialize>(
    stream: &LogStream<T>,
    params: Result<Query<LogParams>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<Vec<LogEntry<T>>>>> {
    let query = params?.0.into_query()?;
    let page = stream.query(&query).await?;
    Ok(ApiResponse::page(page.items, page.total))
}

async fn speed_logs(
    State(state): State<AppState>,
    params: Result<Query<LogParams>, QueryRejection>,
) -> impl IntoResponse {
    query_stream(&state.orchestrator.logs().speed, params).await
}

async fn ip_logs(
    State(state): State<AppState>,
    params: Result<Query<LogParams>, QueryRejection>,
) -> impl IntoResponse {
    query_stream(&state.orchestrator.logs().ip, params).await
}

async fn visit_logs(
    State(state): State<AppState>,
    params: Result<Query<LogParams>, QueryRejection>,
) -> impl IntoResponse {
    query_stream(&state.orchestrator.logs().visit, params).await
}

async fn failure_logs(
    State(state): State<AppState>,
    params: Result<Query<LogParams>, QueryRejection>,
) -> impl IntoResponse {
    query_stream(&state.orchestrator.logs().failure, params).await
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    days: Option<u32>,
}

/// 默认统计最近一周
const DEFAULT_STATS_DAYS: u32 = 7;

async fn failure_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Result<Query<StatsParams>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<FailureStats>>> {
    let id = parse_id(&id)?;
    let days = params?.0.days.unwrap_or(DEFAULT_STATS_DAYS);
    state.orchestrator.store().get(id).await?;
    let stats = state.orchestrator.logs().failure.stats(id, days).await?;
    Ok(ApiResponse::new(stats))
}

#[derive(Debug, Deserialize)]
struct VisitRequest {
    proxy_id: ProxyId,
    #[serde(flatten)]
    sample: VisitSample,
    timestamp: Option<DateTime<Utc>>,
}

async fn record_visit(
    State(state): State<AppState>,
    body: Result<Json<VisitRequest>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<VisitLog>>> {
    let visit = json_body(body)?;
    let sample = visit.sample;
    for (field, value) in [
        ("source_ip", &sample.source_ip),
        ("target_ip", &sample.target_ip),
        ("domain", &sample.domain),
    ] {
        if value.trim().is_empty() {
            return Err(Error::Validation(format!("{} must not be empty", field)).into());
        }
    }
    let mut entry = LogEntry::new(visit.proxy_id, sample);
    if let Some(ts) = visit.timestamp {
        entry = entry.at(ts);
    }
    let entry = state.orchestrator.logs().visit.append_entry(entry).await?;
    Ok(ApiResponse::new(entry))
}

async fn get_settings(State(state): State<AppState>) -> Json<ApiResponse<Settings>> {
    ApiResponse::new(state.orchestrator.settings().current().await)
}

async fn put_settings(
    State(state): State<AppState>,
    body: Result<Json<Settings>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<Settings>>> {
    let settings = state.orchestrator.settings().replace(json_body(body)?).await?;
    Ok(ApiResponse::new(settings))
}
