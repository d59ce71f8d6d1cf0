//! Shared test fixtures: a tiny in-process mock coordinator, for exercising
//! `wud-client`'s loop end-to-end without a real `wud-coordinator` process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedResult {
    pub wuid: Option<String>,
    pub client_id: Option<String>,
    pub exit_code: Option<i64>,
    pub failed_command: Option<i64>,
    pub attachments: Vec<(String, Vec<u8>)>,
}

struct MockState {
    queue: Mutex<VecDeque<String>>,
    files: HashMap<String, Vec<u8>>,
    uploads: Mutex<Vec<UploadedResult>>,
}

pub struct MockCoordinator {
    pub base_url: String,
    state: Arc<MockState>,
}

impl MockCoordinator {
    /// Serves `wu_texts` in order off `GET /cgi-bin/getwu` (204 once
    /// exhausted), `files` off `GET /<name>`, and records every
    /// `POST /cgi-bin/upload.py` body.
    pub async fn start(wu_texts: Vec<String>, files: HashMap<String, Vec<u8>>) -> Self {
        let state = Arc::new(MockState {
            queue: Mutex::new(wu_texts.into_iter().collect()),
            files,
            uploads: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/cgi-bin/getwu", get(get_wu))
            .route("/cgi-bin/upload.py", axum::routing::post(post_result))
            .route("/:filename", get(get_file))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url: format!("http://{addr}"), state }
    }

    pub fn uploads(&self) -> Vec<UploadedResult> {
        self.state.uploads.lock().unwrap().clone()
    }
}

async fn get_wu(State(st): State<Arc<MockState>>) -> Response {
    let next = st.queue.lock().unwrap().pop_front();
    match next {
        Some(text) => (StatusCode::OK, text).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn get_file(State(st): State<Arc<MockState>>, Path(filename): Path<String>) -> Response {
    match st.files.get(&filename) {
        Some(bytes) => (StatusCode::OK, bytes.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn post_result(State(st): State<Arc<MockState>>, mut multipart: Multipart) -> Response {
    let mut result = UploadedResult {
        wuid: None,
        client_id: None,
        exit_code: None,
        failed_command: None,
        attachments: Vec::new(),
    };

    while let Ok(Some(field)) = multipart.next_field().await {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "WUid" => result.wuid = field.text().await.ok(),
            "clientid" => result.client_id = field.text().await.ok(),
            "exitcode" => result.exit_code = field.text().await.ok().and_then(|t| t.parse().ok()),
            "failedcommand" => {
                result.failed_command = field.text().await.ok().and_then(|t| t.parse().ok())
            }
            "results" => {
                let filename = field.file_name().unwrap_or("result").to_string();
                if let Ok(bytes) = field.bytes().await {
                    result.attachments.push((filename, bytes_to_vec(bytes)));
                }
            }
            _ => {}
        }
    }

    st.state_push(result);
    StatusCode::OK.into_response()
}

fn bytes_to_vec(bytes: Bytes) -> Vec<u8> {
    bytes.to_vec()
}

impl MockState {
    fn state_push(&self, result: UploadedResult) {
        self.uploads.lock().unwrap().push(result);
    }
}
