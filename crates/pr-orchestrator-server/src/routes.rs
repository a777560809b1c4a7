use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{TimeZone, Utc};
use pr_orchestrator_core::actions;
use pr_orchestrator_core::error::OrchestratorError;
use pr_orchestrator_core::params::extract_regression_filter;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::dto::{BuilderSummary, ErrorBody, PrInfoDto, StatusDto};
use crate::AppState;

#[derive(Deserialize, Default)]
pub(crate) struct ViewQuery {
    pub compact: Option<i32>,
    pub as_file: Option<i32>,
    pub updated_at: Option<i64>,
}

/// Pretty-printed by default, compact (no whitespace) when `compact=1`.
fn json_response(
    value: impl serde::Serialize,
    compact: Option<i32>,
    as_file: Option<i32>,
    filename: &str,
) -> Response {
    let body = if compact == Some(1) {
        serde_json::to_string(&value)
    } else {
        serde_json::to_string_pretty(&value)
    }
    .expect("DTOs are always serializable");

    let mut resp = Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("static response parts are always valid");

    if as_file == Some(1) {
        resp.headers_mut().insert(
            header::CONTENT_DISPOSITION,
            header::HeaderValue::from_str(&format!("attachment; filename=\"{filename}\""))
                .unwrap(),
        );
    }
    resp
}

fn error_response(err: OrchestratorError) -> Response {
    let http_code = err.http_status();
    let code = StatusCode::from_u16(http_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        code,
        Json(ErrorBody {
            message: err.to_string(),
            http_code,
        }),
    )
        .into_response()
}

fn parse_expected(updated_at: Option<i64>) -> Option<chrono::DateTime<Utc>> {
    updated_at.and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

async fn pr_buildstatus_map(
    state: &AppState,
    prid: i64,
) -> Result<HashMap<i64, StatusDto>, OrchestratorError> {
    let mut map = HashMap::new();
    for status in state.db.list_active_statuses_for_pr(prid).await? {
        let ops_url = Some(format!(
            "/{}/{}/{}",
            state.config.urlpath, prid, status.bid
        ));
        map.insert(status.bid, StatusDto::new(&status, true, ops_url));
    }
    Ok(map)
}

pub(crate) async fn list_root(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ViewQuery>,
) -> Response {
    match list_root_inner(&state).await {
        Ok(body) => json_response(body, q.compact, q.as_file, "pullrequests.json"),
        Err(e) => error_response(e),
    }
}

async fn list_root_inner(state: &AppState) -> Result<serde_json::Value, OrchestratorError> {
    let builders = state.db.list_active_builders().await?;
    let mut builders_by_order = HashMap::new();
    for b in &builders {
        builders_by_order.insert(b.order.to_string(), BuilderSummary::from(b));
    }

    let prs = state.db.list_active_prs().await?;
    let mut pullrequests = HashMap::new();
    for pr in &prs {
        let buildstatus = pr_buildstatus_map(state, pr.prid).await?;
        pullrequests.insert(
            pr.prid.to_string(),
            PrInfoDto::new(pr, &state.config.urlpath, state.hooks.as_ref(), buildstatus),
        );
    }

    Ok(serde_json::json!({
        "builders": builders_by_order,
        "pullrequests": pullrequests,
    }))
}

pub(crate) async fn get_pr(
    State(state): State<Arc<AppState>>,
    Path(prid): Path<i64>,
    Query(q): Query<ViewQuery>,
) -> Response {
    match get_pr_inner(&state, prid).await {
        Ok(dto) => json_response(dto, q.compact, q.as_file, &format!("pr-{prid}.json")),
        Err(e) => error_response(e),
    }
}

async fn get_pr_inner(state: &AppState, prid: i64) -> Result<PrInfoDto, OrchestratorError> {
    let pr = state
        .db
        .get_pr(prid)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("pull request {prid}")))?;
    let buildstatus = pr_buildstatus_map(state, prid).await?;
    Ok(PrInfoDto::new(&pr, &state.config.urlpath, state.hooks.as_ref(), buildstatus))
}

/// Public endpoint: keyed by builder name, never shows `operations`, and
/// omits performance builders unless the PR description carries a matching
/// regression filter.
pub(crate) async fn get_public_status(
    State(state): State<Arc<AppState>>,
    Path(prid): Path<i64>,
    Query(q): Query<ViewQuery>,
) -> Response {
    match get_public_status_inner(&state, prid).await {
        Ok(body) => json_response(body, q.compact, q.as_file, &format!("pr-{prid}-status.json")),
        Err(e) => error_response(e),
    }
}

async fn get_public_status_inner(
    state: &AppState,
    prid: i64,
) -> Result<serde_json::Value, OrchestratorError> {
    let pr = state
        .db
        .get_pr(prid)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("pull request {prid}")))?;
    let has_regression_filter = extract_regression_filter(&pr.description).is_some();

    let builders = state.db.list_active_builders().await?;
    let builder_names: HashMap<i64, String> =
        builders.iter().map(|b| (b.bid, b.name.clone())).collect();
    let perf_bids: std::collections::HashSet<i64> =
        builders.iter().filter(|b| b.is_perf).map(|b| b.bid).collect();

    let mut buildstatus = HashMap::new();
    for status in state.db.list_active_statuses_for_pr(prid).await? {
        if perf_bids.contains(&status.bid) && !has_regression_filter {
            continue;
        }
        let Some(name) = builder_names.get(&status.bid) else {
            continue;
        };
        buildstatus.insert(name.clone(), StatusDto::new(&status, false, None));
    }

    Ok(serde_json::json!({ "buildstatus": buildstatus }))
}

pub(crate) async fn get_status(
    State(state): State<Arc<AppState>>,
    Path((prid, bid)): Path<(i64, i64)>,
    Query(q): Query<ViewQuery>,
) -> Response {
    match get_status_inner(&state, prid, bid).await {
        Ok(dto) => json_response(dto, q.compact, q.as_file, &format!("pr-{prid}-{bid}.json")),
        Err(e) => error_response(e),
    }
}

async fn get_status_inner(state: &AppState, prid: i64, bid: i64) -> Result<StatusDto, OrchestratorError> {
    let status = state
        .db
        .get_active_status(prid, bid)
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("no active status for pr {prid}, builder {bid}")))?;
    let ops_url = Some(format!("/{}/{}/{}", state.config.urlpath, prid, bid));
    Ok(StatusDto::new(&status, true, ops_url))
}

pub(crate) async fn restart_build(
    State(state): State<Arc<AppState>>,
    Path((prid, bid)): Path<(i64, i64)>,
    Query(q): Query<ViewQuery>,
) -> Response {
    let expected = parse_expected(q.updated_at);
    match actions::retry_build(&state.db, &state.scheduler, prid, bid, expected).await {
        Ok(status) => {
            let ops_url = Some(format!("/{}/{}/{}", state.config.urlpath, prid, bid));
            json_response(StatusDto::new(&status, true, ops_url), q.compact, None, "status.json")
        }
        Err(e) => error_response(e),
    }
}

pub(crate) async fn stop_build(
    State(state): State<Arc<AppState>>,
    Path((prid, bid)): Path<(i64, i64)>,
    Query(q): Query<ViewQuery>,
) -> Response {
    let Some(expected) = parse_expected(q.updated_at) else {
        return error_response(OrchestratorError::BadRequest("updated_at is required".into()));
    };
    match actions::stop_build(&state.db, &state.scheduler, prid, bid, expected).await {
        Ok(status) => {
            let ops_url = Some(format!("/{}/{}/{}", state.config.urlpath, prid, bid));
            json_response(StatusDto::new(&status, true, ops_url), q.compact, None, "status.json")
        }
        Err(e) => error_response(e),
    }
}

pub(crate) async fn revert_build(
    State(state): State<Arc<AppState>>,
    Path((prid, bid)): Path<(i64, i64)>,
    Query(q): Query<ViewQuery>,
) -> Response {
    let Some(expected) = parse_expected(q.updated_at) else {
        return error_response(OrchestratorError::BadRequest("updated_at is required".into()));
    };
    match actions::revert_build(&state.db, prid, bid, expected).await {
        Ok(status) => {
            let ops_url = Some(format!("/{}/{}/{}", state.config.urlpath, prid, bid));
            json_response(StatusDto::new(&status, true, ops_url), q.compact, None, "status.json")
        }
        Err(e) => error_response(e),
    }
}

pub(crate) async fn not_found() -> impl IntoResponse {
    error_response(OrchestratorError::NotFound("no such route".into()))
}
