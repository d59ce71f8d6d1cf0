//! Drives `run_client_loop` against `wud-testkit`'s mock coordinator,
//! covering the fetch/verify/execute/upload happy path and the
//! continue-on-command-failure behavior.

use std::collections::HashMap;
use std::time::Duration;

use sha1::{Digest, Sha1};
use wud_client::{run_client_loop, ClientConfig};
use wud_testkit::MockCoordinator;

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

fn config(server: String, dldir: std::path::PathBuf, workdir: std::path::PathBuf) -> ClientConfig {
    ClientConfig {
        clientid: "cli-A".to_string(),
        dldir,
        server,
        workdir,
        wu_filename: "WU".to_string(),
        getwupath: "/cgi-bin/getwu".to_string(),
        postresultpath: "/cgi-bin/upload.py".to_string(),
        arch: "x86_64".to_string(),
        downloadretry: Duration::from_millis(5),
        niceness: 0,
    }
}

#[tokio::test]
async fn fetches_materializes_runs_and_uploads() {
    let data = b"input payload".to_vec();
    let mut files = HashMap::new();
    files.insert("data.bin".to_string(), data.clone());

    let wu_text = format!(
        "WORKUNIT W1\nFILE data.bin {}\nCOMMAND cat ${{DLDIR}}/data.bin > ${{WORKDIR}}/out.txt\nRESULT out.txt\n",
        digest_hex(&data)
    );
    let coordinator = MockCoordinator::start(vec![wu_text], files).await;

    let dldir = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();
    let cfg = config(coordinator.base_url.clone(), dldir.path().to_path_buf(), workdir.path().to_path_buf());

    run_client_loop(&cfg).await.unwrap();

    let uploads = coordinator.uploads();
    assert_eq!(uploads.len(), 1);
    let upload = &uploads[0];
    assert_eq!(upload.wuid.as_deref(), Some("W1"));
    assert_eq!(upload.exit_code, Some(0));
    let out = upload.attachments.iter().find(|(name, _)| name == "out.txt").unwrap();
    assert_eq!(out.1, data);

    // Successful run cleans up the result file and the WU document.
    assert!(!workdir.path().join("out.txt").exists());
    assert!(!dldir.path().join("WU").exists());
}

#[tokio::test]
async fn failing_command_still_uploads_and_loop_continues() {
    let wu_text = "WORKUNIT W2\nCOMMAND echo bad > out.txt; exit 3\nRESULT out.txt\n".to_string();
    let coordinator = MockCoordinator::start(vec![wu_text], HashMap::new()).await;

    let dldir = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();
    let cfg = config(coordinator.base_url.clone(), dldir.path().to_path_buf(), workdir.path().to_path_buf());

    run_client_loop(&cfg).await.unwrap();

    let uploads = coordinator.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].exit_code, Some(3));
    assert_eq!(uploads[0].failed_command, Some(0));
    let out = uploads[0].attachments.iter().find(|(name, _)| name == "out.txt");
    assert!(out.is_some());

    // The upload succeeded even though the command failed, so the result
    // file is still cleaned up from WORKDIR; otherwise a later work-unit
    // declaring the same result filename would find it already present
    // and skip running its own commands.
    assert!(!workdir.path().join("out.txt").exists());
}

#[tokio::test]
async fn no_work_ends_the_loop_cleanly() {
    let coordinator = MockCoordinator::start(vec![], HashMap::new()).await;
    let dldir = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();
    let cfg = config(coordinator.base_url.clone(), dldir.path().to_path_buf(), workdir.path().to_path_buf());

    run_client_loop(&cfg).await.unwrap();
    assert!(coordinator.uploads().is_empty());
}
