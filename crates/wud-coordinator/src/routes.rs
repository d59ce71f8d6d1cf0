//! Axum router and HTTP handlers: the two endpoints the client loop talks
//! to (`GETWUPATH`, `POSTRESULTPATH`) plus a raw file-serving route.
//!
//! `build_router` is the single entry point; `main.rs` attaches tracing and
//! CORS middleware on top so integration tests can exercise the bare
//! router.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use tracing::{info, warn};
use wud_db::ResultFile;

use crate::state::AppState;

pub fn build_router(state: Arc<AppState>, getwupath: &str, postresultpath: &str) -> Router {
    Router::new()
        .route(getwupath, get(get_wu))
        .route(postresultpath, axum::routing::post(post_result))
        .route("/:filename", get(get_file))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub(crate) struct GetWuParams {
    clientid: String,
}

/// `GET ${GETWUPATH}?clientid=<id>`. A body means work; 204 means none.
pub(crate) async fn get_wu(
    State(st): State<Arc<AppState>>,
    Query(params): Query<GetWuParams>,
) -> Response {
    match st.db.assign(&params.clientid).await {
        Ok(Some(wu_text)) => (StatusCode::OK, wu_text).into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            warn!(error = %e, "assign failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `GET /<filename>`: serves a file previously uploaded as a result, or an
/// input/executable artifact seeded into `files_dir` out of band.
pub(crate) async fn get_file(State(st): State<Arc<AppState>>, Path(filename): Path<String>) -> Response {
    let path = st.files_dir.join(&filename);
    match tokio::fs::read(&path).await {
        Ok(bytes) => (StatusCode::OK, bytes).into_response(),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// `POST ${POSTRESULTPATH}`: multipart body with scalar fields
/// `WUid`/`clientid`/`exitcode`/`failedcommand` plus any number of `results`
/// parts (declared result files and/or `stdout<i>`/`stderr<i>` captures).
pub(crate) async fn post_result(State(st): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let mut wuid: Option<String> = None;
    let mut client_id: Option<String> = None;
    let mut exit_code: i64 = 0;
    let mut failed_command: Option<i64> = None;
    let mut files: Vec<ResultFile> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "malformed multipart body");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "WUid" => wuid = field.text().await.ok(),
            "clientid" => client_id = field.text().await.ok(),
            "exitcode" => {
                exit_code = field.text().await.ok().and_then(|t| t.parse().ok()).unwrap_or(0)
            }
            "failedcommand" => {
                failed_command = field.text().await.ok().and_then(|t| t.parse().ok())
            }
            "results" => {
                let filename = field.file_name().unwrap_or("result").to_string();
                let bytes: Bytes = match field.bytes().await {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(error = %e, "failed reading results part");
                        return StatusCode::BAD_REQUEST.into_response();
                    }
                };
                let Some(wuid_ref) = wuid.as_deref() else {
                    return StatusCode::BAD_REQUEST.into_response();
                };
                let dir = st.files_dir.join(wuid_ref);
                if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                    warn!(error = %e, "failed creating result directory");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
                let path = dir.join(&filename);
                if let Err(e) = tokio::fs::write(&path, &bytes).await {
                    warn!(error = %e, "failed writing result attachment");
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
                files.push(ResultFile { filename, path: path.display().to_string() });
            }
            _ => {}
        }
    }

    let (Some(wuid), Some(client_id)) = (wuid, client_id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    match st.db.result(&wuid, &client_id, &files, exit_code, failed_command).await {
        Ok(()) => {
            info!(wuid, "recorded result upload");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            warn!(wuid, error = %e, "result upload rejected");
            StatusCode::CONFLICT.into_response()
        }
    }
}
