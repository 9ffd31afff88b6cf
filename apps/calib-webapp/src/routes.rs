use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post, put},
    Json, Router,
};
use chessboard_vision::{GenericService, MimeType, PassStore};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::html::index_page;

pub struct AppState {
    pub store: PassStore,
    pub calibration: Option<Arc<dyn GenericService>>,
    pub watcher_enabled: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/download/{pass_id}/{file}", get(download))
        .route("/api/passes", get(list_passes))
        .route("/api/complete_pass/{pass_id}", post(complete_pass))
        .route("/api/passes/{pass_id}/files/{file}", put(upload))
        .route("/api/calibration/do_command", post(calibration_do_command))
        .with_state(Arc::new(state))
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn index(State(state): State<Arc<AppState>>) -> ApiResult<Html<String>> {
    let passes = state.store.list_passes()?;
    Ok(Html(index_page(&passes, state.watcher_enabled)))
}

async fn download(
    State(state): State<Arc<AppState>>,
    Path((pass_id, file)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let path = state.store.file_path(&pass_id, &file)?;
    if !path.is_file() {
        return Err(ApiError::not_found("File not found"));
    }
    let data = tokio::fs::read(&path)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    let mime = path
        .extension()
        .and_then(|e| e.to_str())
        .map(MimeType::from_extension)
        .unwrap_or(MimeType::Unknown);
    Ok(([(header::CONTENT_TYPE, mime.as_str())], data))
}

/// `{pass_id: {"files": [...], "complete": bool}}`
async fn list_passes(State(state): State<Arc<AppState>>) -> ApiResult<Json<Map<String, Value>>> {
    let passes = state
        .store
        .list_passes()?
        .into_iter()
        .map(|p| {
            let files: Vec<String> = p.files.into_iter().map(|f| f.name).collect();
            (p.pass_id, json!({ "files": files, "complete": p.complete }))
        })
        .collect();
    Ok(Json(passes))
}

async fn complete_pass(
    State(state): State<Arc<AppState>>,
    Path(pass_id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    if !state.store.exists(&pass_id) {
        return Err(ApiError::not_found("Pass not found"));
    }
    let metadata = if body.is_empty() {
        None
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Object(map)) => Some(map),
            _ => return Err(ApiError::bad_request("metadata must be a JSON object")),
        }
    };
    state.store.mark_pass_complete(&pass_id, metadata.as_ref())?;
    Ok(Json(json!({ "status": "complete", "pass_id": pass_id })))
}

async fn upload(
    State(state): State<Arc<AppState>>,
    Path((pass_id, file)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    state.store.save_file(&pass_id, &file, &body)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "status": "saved", "pass_id": pass_id, "file": file, "bytes": body.len() })),
    ))
}

async fn calibration_do_command(
    State(state): State<Arc<AppState>>,
    Json(command): Json<Map<String, Value>>,
) -> ApiResult<Json<Map<String, Value>>> {
    let service = state
        .calibration
        .clone()
        .ok_or_else(|| ApiError::not_found("no calibration service configured"))?;
    info!(keys = ?command.keys().collect::<Vec<_>>(), "calibration do_command");
    let reply = tokio::task::spawn_blocking(move || service.do_command(&command))
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    match reply {
        Ok(reply) => Ok(Json(reply)),
        Err(e) => {
            warn!(error = %e, "do_command rejected");
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use chessboard_vision::{CameraCalibrationService, ComponentConfig, Model};
    use tower::ServiceExt;

    fn app(dir: &std::path::Path, with_service: bool) -> Router {
        let calibration = with_service.then(|| {
            let attrs = json!({"pattern_size": [9, 6], "square_size_mm": 30});
            let cfg = ComponentConfig::new(
                "calibration",
                Model::camera_calibration(),
                attrs.as_object().cloned().unwrap(),
            );
            Arc::new(CameraCalibrationService::new(&cfg).unwrap()) as Arc<dyn GenericService>
        });
        router(AppState {
            store: PassStore::new(dir).unwrap(),
            calibration,
            watcher_enabled: false,
        })
    }

    fn request(method: Method, uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body.into())
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(dir.path(), false)
            .oneshot(request(Method::GET, "/health", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "healthy");
    }

    #[tokio::test]
    async fn upload_list_download_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), false);

        let resp = app
            .clone()
            .oneshot(request(Method::PUT, "/api/passes/pass-1/files/data.txt", "test"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = app
            .clone()
            .oneshot(request(Method::GET, "/download/pass-1/data.txt", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"test");

        let resp = app
            .clone()
            .oneshot(request(Method::POST, "/api/complete_pass/pass-1", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            body_json(resp).await,
            json!({"status": "complete", "pass_id": "pass-1"})
        );

        let resp = app
            .clone()
            .oneshot(request(Method::GET, "/api/passes", Body::empty()))
            .await
            .unwrap();
        let passes = body_json(resp).await;
        assert_eq!(passes["pass-1"]["complete"], true);
        assert_eq!(passes["pass-1"]["files"], json!([".complete", "data.txt"]));

        let resp = app
            .oneshot(request(Method::GET, "/", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let page = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let page = String::from_utf8(page.to_vec()).unwrap();
        assert!(page.contains("/download/pass-1/data.txt"));
        assert!(!page.contains("/download/pass-1/.complete"));
    }

    #[tokio::test]
    async fn missing_files_and_passes_are_404() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), false);

        let resp = app
            .clone()
            .oneshot(request(Method::GET, "/download/nope/file.txt", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = app
            .clone()
            .oneshot(request(Method::POST, "/api/complete_pass/nope", Body::empty()))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(resp).await["error"], "Pass not found");

        let resp = app
            .oneshot(request(Method::PUT, "/api/passes/..secret/files/x", "x"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn completion_metadata_lands_in_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("p")).unwrap();
        let resp = app(dir.path(), false)
            .oneshot(request(
                Method::POST,
                "/api/complete_pass/p",
                r#"{"operator": "ana"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let sentinel: Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("p/.complete")).unwrap()).unwrap();
        assert_eq!(sentinel["operator"], "ana");
        assert!(sentinel["completed_at"].is_string());
    }

    #[tokio::test]
    async fn do_command_forwards_to_service() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path(), true);

        let resp = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/calibration/do_command",
                r#"{"calibrate_camera": {"images": []}}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let reply = body_json(resp).await;
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"], "At least one image is required for calibration.");

        let resp = app
            .oneshot(request(Method::POST, "/api/calibration/do_command", r#"{"bogus": 1}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn do_command_without_service_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(dir.path(), false)
            .oneshot(request(Method::POST, "/api/calibration/do_command", "{}"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
