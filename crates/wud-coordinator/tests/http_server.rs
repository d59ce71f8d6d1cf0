//! End-to-end HTTP exercise of the coordinator's two endpoints, against a
//! server bound to an ephemeral port in-process.

use std::sync::Arc;

use wud_coordinator::{routes, state::AppState};
use wud_db::{connect, migrate, WuAccess};

async fn spawn_server() -> (String, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("wud.db").display());
    let pool = connect(&url).await.unwrap();
    migrate(&pool).await.unwrap();
    let db = WuAccess::new(pool);

    let files_dir = dir.path().join("files");
    tokio::fs::create_dir_all(&files_dir).await.unwrap();
    let state = AppState::new(db, files_dir);
    let app = routes::build_router(Arc::clone(&state), "/getwu", "/result");

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{addr}"), dir)
}

#[tokio::test]
async fn no_work_returns_no_content() {
    let (base, _dir) = spawn_server().await;
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{base}/getwu?clientid=cli-A"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn assign_then_upload_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("wud.db").display());
    let pool = connect(&url).await.unwrap();
    migrate(&pool).await.unwrap();
    let db = WuAccess::new(pool);
    db.create("WORKUNIT W1\nCOMMAND echo hi\nRESULT out.txt\n", None)
        .await
        .unwrap();

    let files_dir = dir.path().join("files");
    tokio::fs::create_dir_all(&files_dir).await.unwrap();
    let state = AppState::new(db.clone(), files_dir);
    let app = routes::build_router(Arc::clone(&state), "/getwu", "/result");
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    let base = format!("http://{addr}");

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("{base}/getwu?clientid=cli-A"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    let body = resp.text().await.unwrap();
    assert!(body.contains("WORKUNIT W1"));

    let form = reqwest::multipart::Form::new()
        .text("WUid", "W1")
        .text("clientid", "cli-A")
        .text("exitcode", "0")
        .part(
            "results",
            reqwest::multipart::Part::bytes(b"hi\n".to_vec()).file_name("out.txt"),
        );
    let resp = client
        .post(format!("{base}/result"))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);

    let rows = db
        .query_by_status(wud_state::WuStatus::ReceivedOk)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].files.len(), 1);
    assert_eq!(rows[0].files[0].filename, "out.txt");
}
