//! # API REST
//!
//! REST API for the clinical data repository.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - Mapping `CdrError` onto HTTP status codes
//!
//! Handlers decode, delegate to [`CdrService`] and encode; everything else lives in `cdr-core`.
//! Every service call takes blocking locks and runs on `spawn_blocking`.

#![warn(rust_2018_idioms)]

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, post, put},
    Router,
};
use cdr_core::views::{
    CodeView, CodesView, DiagnosisPatientsView, FileInfoView, ObservationView, ProblemListView,
    StatusView,
};
use cdr_core::{
    CdrError, CdrService, DiagnosisSystem, GcReport, IngestOutcome, IngestRequest, Mrn,
    ProblemFilter,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

/// Error half of every handler result: a status code and a short body.
pub type ApiError = (StatusCode, String);

/// Application state shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CdrService>,
}

impl AppState {
    pub fn new(service: CdrService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IngestRes {
    pub message: String,
    /// `accepted` or `obsolete`.
    pub outcome: String,
    pub observations: usize,
    pub replaced: usize,
}

impl From<IngestOutcome> for IngestRes {
    fn from(outcome: IngestOutcome) -> Self {
        match outcome {
            IngestOutcome::Accepted {
                observations,
                replaced,
            } => IngestRes {
                message: "Document accepted".into(),
                outcome: "accepted".into(),
                observations,
                replaced,
            },
            IngestOutcome::Obsolete => IngestRes {
                message: "A document with the same or a newer generation time is already stored"
                    .into(),
                outcome: "obsolete".into(),
                observations: 0,
                replaced: 0,
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct RemoveRes {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct GcRes {
    pub observations_purged: usize,
    pub statuses_purged: usize,
    pub preview: bool,
    pub interrupted: bool,
}

impl From<GcReport> for GcRes {
    fn from(report: GcReport) -> Self {
        Self {
            observations_purged: report.observations_purged,
            statuses_purged: report.statuses_purged,
            preview: report.preview,
            interrupted: report.interrupted,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ProblemListQuery {
    /// URL-encoded JSON filter, e.g. `{"filter": {"icd9": {"code": ["296.2*"]}}}`.
    pub filter: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct GcQuery {
    /// Count what would be purged without deleting anything.
    pub preview: Option<bool>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        ingest_ccda,
        remove_ccda,
        file_info,
        problem_list,
        codes,
        diagnosis_patients,
        collect_garbage,
    ),
    components(schemas(
        HealthRes,
        IngestRequest,
        IngestRes,
        RemoveRes,
        GcRes,
        CodeView,
        StatusView,
        ObservationView,
        FileInfoView,
        ProblemListView,
        CodesView,
        DiagnosisPatientsView,
    ))
)]
pub struct ApiDoc;

/// Build the REST router, including the OpenAPI document and Swagger UI.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/patients/:mrn/ccda", put(ingest_ccda))
        .route("/patients/:mrn/ccda", delete(remove_ccda))
        .route("/patients/:mrn/ccda/file_info", get(file_info))
        .route("/patients/:mrn/problem_list", get(problem_list))
        .route("/codes/:system", get(codes))
        .route("/diagnosis/:system/:code/patients", get(diagnosis_patients))
        .route("/admin/gc", post(collect_garbage))
        .merge(
            SwaggerUi::new("/swagger-ui/{_:.*}").url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn internal_error(context: &str, e: impl std::fmt::Debug) -> ApiError {
    tracing::error!("{context}: {:?}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".into())
}

fn map_error(context: &str, e: CdrError) -> ApiError {
    if e.is_client_error() {
        tracing::warn!("{context}: {e}");
        (StatusCode::BAD_REQUEST, e.to_string())
    } else {
        internal_error(context, e)
    }
}

/// Run a synchronous service call on the blocking pool.
async fn blocking<T, F>(context: &'static str, call: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, CdrError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| internal_error(context, e))?
        .map_err(|e| map_error(context, e))
}

fn parse_mrn(raw: &str) -> Result<Mrn, ApiError> {
    Mrn::new(raw).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

fn parse_system(raw: &str) -> Result<DiagnosisSystem, ApiError> {
    raw.parse()
        .map_err(|e: CdrError| (StatusCode::BAD_REQUEST, e.to_string()))
}

fn unknown_mrn(mrn: &Mrn) -> ApiError {
    (StatusCode::NOT_FOUND, format!("No document stored for MRN {mrn}"))
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for monitoring and load balancers.
#[axum::debug_handler]
async fn health(State(_state): State<AppState>) -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "CDR REST API is alive".into(),
    })
}

#[utoipa::path(
    put,
    path = "/patients/{mrn}/ccda",
    params(("mrn" = String, Path, description = "Medical record number")),
    request_body = IngestRequest,
    responses(
        (status = 200, description = "Document accepted or reported obsolete", body = IngestRes),
        (status = 400, description = "Malformed document or request"),
        (status = 500, description = "Internal server error")
    )
)]
/// Ingest a converted CCDA for a patient.
///
/// The document replaces the stored one only if its generation time is strictly newer; otherwise
/// the response reports `obsolete` and nothing changes.
///
/// # Errors
/// Returns `400 Bad Request` if the MRN, a timestamp or the problem list is malformed, and
/// `500 Internal Server Error` for storage failures.
#[axum::debug_handler]
async fn ingest_ccda(
    State(state): State<AppState>,
    Path(mrn): Path<String>,
    Json(req): Json<IngestRequest>,
) -> Result<Json<IngestRes>, ApiError> {
    let mrn = parse_mrn(&mrn)?;
    let service = state.service.clone();
    let outcome = blocking("Ingest error", move || service.ingest(&mrn, req)).await?;
    Ok(Json(IngestRes::from(outcome)))
}

#[utoipa::path(
    delete,
    path = "/patients/{mrn}/ccda",
    params(("mrn" = String, Path, description = "Medical record number")),
    responses(
        (status = 200, description = "Document removed", body = RemoveRes),
        (status = 404, description = "Unknown MRN"),
        (status = 500, description = "Internal server error")
    )
)]
/// Remove a patient's document. Its observations stay until the next garbage collection.
#[axum::debug_handler]
async fn remove_ccda(
    State(state): State<AppState>,
    Path(mrn): Path<String>,
) -> Result<Json<RemoveRes>, ApiError> {
    let mrn = parse_mrn(&mrn)?;
    let service = state.service.clone();
    let key = mrn.clone();
    let removed = blocking("Remove document error", move || service.remove_document(&key)).await?;

    if !removed {
        return Err(unknown_mrn(&mrn));
    }
    Ok(Json(RemoveRes {
        message: format!("Removed document for MRN {mrn}"),
    }))
}

#[utoipa::path(
    get,
    path = "/patients/{mrn}/ccda/file_info",
    params(("mrn" = String, Path, description = "Medical record number")),
    responses(
        (status = 200, description = "Current document metadata", body = FileInfoView),
        (status = 404, description = "Unknown MRN"),
        (status = 500, description = "Internal server error")
    )
)]
#[axum::debug_handler]
async fn file_info(
    State(state): State<AppState>,
    Path(mrn): Path<String>,
) -> Result<Json<FileInfoView>, ApiError> {
    let mrn = parse_mrn(&mrn)?;
    let service = state.service.clone();
    let key = mrn.clone();
    blocking("File info error", move || service.file_info(&key))
        .await?
        .map(Json)
        .ok_or_else(|| unknown_mrn(&mrn))
}

#[utoipa::path(
    get,
    path = "/patients/{mrn}/problem_list",
    params(("mrn" = String, Path, description = "Medical record number"), ProblemListQuery),
    responses(
        (status = 200, description = "Current problem list", body = ProblemListView),
        (status = 400, description = "Malformed filter"),
        (status = 404, description = "Unknown MRN"),
        (status = 500, description = "Internal server error")
    )
)]
/// The current problem list of a patient, optionally filtered.
///
/// Filter patterns ending in `*` match by prefix; field clauses are ORed and status conditions
/// must all hold.
#[axum::debug_handler]
async fn problem_list(
    State(state): State<AppState>,
    Path(mrn): Path<String>,
    Query(query): Query<ProblemListQuery>,
) -> Result<Json<ProblemListView>, ApiError> {
    let mrn = parse_mrn(&mrn)?;
    let filter = query
        .filter
        .as_deref()
        .map(ProblemFilter::from_json_str)
        .transpose()
        .map_err(|e| map_error("Problem list filter error", e))?;

    let service = state.service.clone();
    let key = mrn.clone();
    blocking("Problem list error", move || {
        service.problem_list(&key, filter.as_ref())
    })
    .await?
    .map(Json)
    .ok_or_else(|| unknown_mrn(&mrn))
}

#[utoipa::path(
    get,
    path = "/codes/{system}",
    params(("system" = String, Path, description = "icd9 or icd10")),
    responses(
        (status = 200, description = "Codes in use by current documents", body = CodesView),
        (status = 400, description = "Unknown code system"),
        (status = 500, description = "Internal server error")
    )
)]
#[axum::debug_handler]
async fn codes(
    State(state): State<AppState>,
    Path(system): Path<String>,
) -> Result<Json<CodesView>, ApiError> {
    let system = parse_system(&system)?;
    let service = state.service.clone();
    blocking("Codes error", move || service.codes(system))
        .await
        .map(Json)
}

#[utoipa::path(
    get,
    path = "/diagnosis/{system}/{code}/patients",
    params(
        ("system" = String, Path, description = "icd9 or icd10"),
        ("code" = String, Path, description = "Exact code, or a prefix ending in `*`")
    ),
    responses(
        (status = 200, description = "Patients with a matching diagnosis", body = DiagnosisPatientsView),
        (status = 400, description = "Unknown code system"),
        (status = 500, description = "Internal server error")
    )
)]
#[axum::debug_handler]
async fn diagnosis_patients(
    State(state): State<AppState>,
    Path((system, code)): Path<(String, String)>,
) -> Result<Json<DiagnosisPatientsView>, ApiError> {
    let system = parse_system(&system)?;
    let service = state.service.clone();
    blocking("Diagnosis query error", move || {
        service.diagnosis_patients(system, &code)
    })
    .await
    .map(Json)
}

#[utoipa::path(
    post,
    path = "/admin/gc",
    params(GcQuery),
    responses(
        (status = 200, description = "Purge counts", body = GcRes),
        (status = 500, description = "Internal server error")
    )
)]
/// Purge observations of removed or replaced documents, then unreferenced statuses.
///
/// With `preview=true` the counts are reported and nothing is deleted.
#[axum::debug_handler]
async fn collect_garbage(
    State(state): State<AppState>,
    Query(query): Query<GcQuery>,
) -> Result<Json<GcRes>, ApiError> {
    let preview = query.preview.unwrap_or(false);
    let service = state.service.clone();
    let report = blocking("GC error", move || service.collect_garbage(preview, None)).await?;
    Ok(Json(GcRes::from(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use cdr_core::config::local_zone_from_env_value;
    use cdr_core::{CoreConfig, MemoryStore};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn app() -> Router {
        let zone = local_zone_from_env_value(Some("UTC".into())).expect("zone");
        let service = CdrService::new(
            Arc::new(CoreConfig::in_memory(zone)),
            Arc::new(MemoryStore::new()),
        );
        router(AppState::new(service))
    }

    fn status(value: &str, display: &str) -> Value {
        json!({"_": {"observation": {"_": {
            "statusCode": {"_code": "completed"},
            "value": {
                "_code": value,
                "_codeSystem": "2.16.840.1.113883.6.96",
                "_codeSystemName": "SNOMED CT",
                "_displayName": display
            }
        }}}})
    }

    fn entry(icd9: &str, status: Value) -> Value {
        json!({"act": {"_": {"entryRelationship": {"_": {"observation": {"_": {
            "author": {"time": {"_value": "20190101120000+0000"}},
            "value": {"_": {"translation": {
                "_code": icd9,
                "_codeSystem": "2.16.840.1.113883.6.103",
                "_codeSystemName": "ICD-9-CM",
                "_displayName": "diagnosis"
            }}},
            "entryRelationship": status
        }}}}}}})
    }

    fn ingest_body(generated: &str) -> String {
        json!({
            "filepath": "/archive/doc.xml",
            "effectiveTime": generated,
            "problem_list": {"section": {
                "code": {"_displayName": "Problem List"},
                "entry": [
                    entry("296.30", status("55561003", "Active")),
                    entry("311", status("73425007", "Inactive"))
                ]
            }}
        })
        .to_string()
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<String>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if body.is_some() {
            request = request.header("content-type", "application/json");
        }
        let request = request
            .body(body.map(Body::from).unwrap_or_else(Body::empty))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[test]
    fn openapi_documents_the_core_ingest_request() {
        let doc = serde_json::to_value(ApiDoc::openapi()).expect("openapi json");
        let properties = &doc["components"]["schemas"]["IngestRequest"]["properties"];
        for field in ["filepath", "effectiveTime", "receipt_time", "lastvisit_time", "problem_list"] {
            assert!(properties.get(field).is_some(), "missing {field}");
        }
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (status, body) = send(&app(), Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true));
    }

    #[tokio::test]
    async fn ingest_then_query() {
        let app = app();
        let (status, body) = send(
            &app,
            Method::PUT,
            "/patients/abc123/ccda",
            Some(ingest_body("2019-11-15T00:00:00Z")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], json!("accepted"));
        assert_eq!(body["observations"], json!(2));

        let (status, body) = send(
            &app,
            Method::PUT,
            "/patients/abc123/ccda",
            Some(ingest_body("2019-11-15T00:00:00Z")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], json!("obsolete"));

        let (status, body) =
            send(&app, Method::GET, "/patients/abc123/ccda/file_info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["filepath"], json!("/archive/doc.xml"));

        // {"status":{"value":{"code":"55561003"}}}
        let (status, body) = send(
            &app,
            Method::GET,
            "/patients/abc123/problem_list?filter=%7B%22status%22%3A%7B%22value%22%3A%7B%22code%22%3A%2255561003%22%7D%7D%7D",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let problems = body["problem_list"].as_array().expect("problem list");
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0]["icd9"]["code"], json!("296.30"));

        let (status, body) = send(&app, Method::GET, "/codes/ICD9", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["codes"].as_array().map(Vec::len), Some(2));

        let (status, body) =
            send(&app, Method::GET, "/diagnosis/icd9/296.*/patients", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["patients"], json!(["abc123"]));
    }

    #[tokio::test]
    async fn client_errors_map_to_400_and_404() {
        let app = app();
        let (status, _) = send(&app, Method::GET, "/patients/nobody/problem_list", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, Method::DELETE, "/patients/nobody/ccda", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(&app, Method::GET, "/codes/icd11", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let mut body: Value =
            serde_json::from_str(&ingest_body("2019-11-15T00:00:00Z")).expect("fixture");
        body["problem_list"]["section"]["code"]["_displayName"] = json!("Allergies");
        let (status, _) = send(
            &app,
            Method::PUT,
            "/patients/abc123/ccda",
            Some(body.to_string()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&app, Method::GET, "/patients/abc123/ccda/file_info", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = send(
            &app,
            Method::PUT,
            "/patients/abc123/ccda",
            Some(ingest_body("2019-11-15T00:00:00Z")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(
            &app,
            Method::GET,
            "/patients/abc123/problem_list?filter=nope",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn remove_then_gc() {
        let app = app();
        send(
            &app,
            Method::PUT,
            "/patients/abc123/ccda",
            Some(ingest_body("2019-11-15T00:00:00Z")),
        )
        .await;
        let (status, _) = send(&app, Method::DELETE, "/patients/abc123/ccda", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, Method::POST, "/admin/gc?preview=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["observations_purged"], json!(2));
        assert_eq!(body["preview"], json!(true));

        let (_, body) = send(&app, Method::POST, "/admin/gc", None).await;
        assert_eq!(body["observations_purged"], json!(2));
        assert_eq!(body["statuses_purged"], json!(2));

        let (_, body) = send(&app, Method::POST, "/admin/gc", None).await;
        assert_eq!(body["observations_purged"], json!(0));
    }
}
