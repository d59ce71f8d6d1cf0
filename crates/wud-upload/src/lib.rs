//! Assembles and POSTs the multipart result document: one part per
//! declared result file plus one per non-empty captured stdout/stderr
//! buffer, with the scalar status fields alongside. Unlike a work-unit
//! fetch or file download, there's no permanent-failure status for an
//! upload: transport errors and non-2xx responses alike are retried
//! forever on a fixed delay, since a result must eventually land.

use std::time::Duration;

use reqwest::multipart::{Form, Part};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("request build error: {0}")]
    Request(reqwest::Error),
}

/// One result file or captured stdio buffer, attached under the `results`
/// field name with `filename` set to its declared or synthesized name.
pub struct Attachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

pub struct ResultUpload {
    pub wuid: String,
    pub client_id: String,
    /// Present only when the run produced a definite exit status.
    pub exit_code: Option<i64>,
    /// Zero-based index of the command that failed, if any.
    pub failed_command: Option<i64>,
    pub files: Vec<Attachment>,
}

impl ResultUpload {
    /// Named `stdout<i>`/`stderr<i>` attachments for every non-empty
    /// captured buffer, in command order. Callers build this from
    /// `wud_exec::CommandOutcome` before constructing a `ResultUpload`.
    pub fn stdio_attachment(kind: &str, index: usize, bytes: Vec<u8>) -> Attachment {
        Attachment { filename: format!("{kind}{index}"), bytes }
    }

    fn into_form(self) -> Form {
        let mut form = Form::new().text("WUid", self.wuid).text("clientid", self.client_id);
        if let Some(code) = self.exit_code {
            form = form.text("exitcode", code.to_string());
        }
        if let Some(index) = self.failed_command {
            form = form.text("failedcommand", index.to_string());
        }
        for attachment in self.files {
            let part = Part::bytes(attachment.bytes).file_name(attachment.filename);
            form = form.part("results", part);
        }
        form
    }
}

pub struct Uploader {
    client: reqwest::Client,
    retry_delay: Duration,
}

impl Uploader {
    pub fn new(client: reqwest::Client, retry_delay: Duration) -> Self {
        Self { client, retry_delay }
    }

    pub async fn upload(&self, url: &str, result: ResultUpload) -> Result<(), UploadError> {
        let wuid = result.wuid.clone();
        loop {
            let form = clone_form_source(&result).into_form();
            match self.client.post(url).multipart(form).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(wuid = %wuid, "uploaded result");
                    return Ok(());
                }
                Ok(response) => {
                    warn!(wuid = %wuid, status = %response.status(), "server rejected upload, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                    warn!(wuid = %wuid, error = %e, "transient network error, retrying upload");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(UploadError::Request(e)),
            }
        }
    }
}

/// `reqwest::multipart::Form` isn't `Clone`, and a retried upload needs a
/// fresh one each attempt, so we rebuild it from an un-consumed clone of
/// the source data.
fn clone_form_source(result: &ResultUpload) -> ResultUpload {
    ResultUpload {
        wuid: result.wuid.clone(),
        client_id: result.client_id.clone(),
        exit_code: result.exit_code,
        failed_command: result.failed_command,
        files: result
            .files
            .iter()
            .map(|a| Attachment { filename: a.filename.clone(), bytes: a.bytes.clone() })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    async fn serve_and_capture(status: u16) -> (SocketAddr, tokio::sync::oneshot::Receiver<Vec<u8>>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = vec![0u8; 64 * 1024];
                let n = stream.read(&mut buf).await.unwrap_or(0);
                let _ = tx.send(buf[..n].to_vec());
                let reason = if status == 200 { "OK" } else { "Error" };
                let response = format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });
        (addr, rx)
    }

    /// Binds one listener that answers successive connections with the
    /// statuses in `statuses`, in order, then stops accepting.
    async fn serve_sequence(statuses: Vec<u16>) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            for status in statuses {
                if let Ok((mut stream, _)) = listener.accept().await {
                    let mut buf = vec![0u8; 64 * 1024];
                    let _ = stream.read(&mut buf).await;
                    let reason = if status == 200 { "OK" } else { "Error" };
                    let response =
                        format!("HTTP/1.1 {status} {reason}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn uploads_scalar_fields_and_attachments() {
        let (addr, rx) = serve_and_capture(200).await;
        let uploader = Uploader::new(reqwest::Client::new(), Duration::from_millis(1));

        let upload = ResultUpload {
            wuid: "W1".to_string(),
            client_id: "cli-A".to_string(),
            exit_code: Some(0),
            failed_command: None,
            files: vec![
                Attachment { filename: "out.txt".to_string(), bytes: b"result data".to_vec() },
                ResultUpload::stdio_attachment("stdout", 0, b"hi\n".to_vec()),
            ],
        };

        uploader.upload(&format!("http://{addr}/result"), upload).await.unwrap();

        let body = String::from_utf8_lossy(&rx.await.unwrap()).to_string();
        assert!(body.contains("WUid"));
        assert!(body.contains("out.txt"));
        assert!(body.contains("stdout0"));
        assert!(body.contains("result data"));
    }

    #[tokio::test]
    async fn http_error_is_retried_until_success() {
        let addr = serve_sequence(vec![500, 503, 200]).await;
        let uploader = Uploader::new(reqwest::Client::new(), Duration::from_millis(1));

        let upload = ResultUpload {
            wuid: "W2".to_string(),
            client_id: "cli-A".to_string(),
            exit_code: Some(1),
            failed_command: Some(0),
            files: vec![],
        };
        uploader.upload(&format!("http://{addr}/result"), upload).await.unwrap();
    }
}
