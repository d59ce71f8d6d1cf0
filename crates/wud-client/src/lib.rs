//! The client loop: fetch a work-unit, materialize its declared files,
//! run its commands, upload the result, clean up, repeat. Mirrors
//! `wuclient.py`'s `do_work`/`Workunit_Processor.process`, but a failing
//! command still uploads a RECEIVED_ERROR result and the loop moves on to
//! the next work-unit instead of exiting (the source's
//! `while do_work(): pass` main loop treats a failing command as
//! indistinguishable from "no more work" and exits early; see DESIGN.md).

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};
use wud_exec::{run_commands, RunnerConfig};
use wud_fetch::{Downloader, FetchError};
use wud_model::{safe_substitute, Workunit};
use wud_upload::{Attachment, ResultUpload, Uploader};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Exec(#[from] wud_exec::ExecError),
    #[error(transparent)]
    Upload(#[from] wud_upload::UploadError),
    #[error(transparent)]
    Parse(#[from] wud_model::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct ClientConfig {
    pub clientid: String,
    pub dldir: PathBuf,
    pub server: String,
    pub workdir: PathBuf,
    pub wu_filename: String,
    pub getwupath: String,
    pub postresultpath: String,
    pub arch: String,
    pub downloadretry: Duration,
    pub niceness: i32,
}

impl ClientConfig {
    fn settings(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("CLIENTID".into(), self.clientid.clone());
        vars.insert("DLDIR".into(), self.dldir.display().to_string());
        vars.insert("SERVER".into(), self.server.clone());
        vars.insert("WORKDIR".into(), self.workdir.display().to_string());
        vars.insert("ARCH".into(), self.arch.clone());
        vars
    }
}

/// Runs until the coordinator reports no more work (a permanent HTTP
/// failure on the WU-fetch URL), or a fatal local I/O error occurs.
pub async fn run_client_loop(config: &ClientConfig) -> Result<(), ClientError> {
    let client = reqwest::Client::new();
    let downloader = Downloader::new(client.clone(), config.downloadretry);
    let uploader = Uploader::new(client, config.downloadretry);

    let wu_path = config.dldir.join(&config.wu_filename);
    let wu_url = format!(
        "{}{}?clientid={}",
        config.server, config.getwupath, config.clientid
    );

    loop {
        let _ = tokio::fs::remove_file(&wu_path).await;
        tokio::fs::create_dir_all(&config.dldir).await?;

        match downloader.get_missing_file(&wu_url, &wu_path, None).await {
            Ok(()) => {}
            Err(FetchError::PermanentHttp(status)) => {
                info!(%status, "coordinator has no work, exiting");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        if let Err(e) = process_one(config, &downloader, &uploader, &wu_path).await {
            warn!(error = %e, "failed to process work-unit, continuing with the next one");
        }
    }
}

async fn process_one(
    config: &ClientConfig,
    downloader: &Downloader,
    uploader: &Uploader,
    wu_path: &Path,
) -> Result<(), ClientError> {
    let text = tokio::fs::read_to_string(wu_path).await?;
    let wu = Workunit::parse(&text)?;
    info!(wuid = %wu.wuid, "processing work-unit");

    materialize_files(config, downloader, &wu).await?;

    let all_results_present = all_results_exist(config, &wu).await;
    let (exit_code, failed_command, captures) = if all_results_present {
        info!(wuid = %wu.wuid, "all result files already present, skipping execution");
        (0, None, Vec::new())
    } else {
        let outcome = run_commands(
            &wu.commands,
            &config.settings(),
            &RunnerConfig { workdir: config.workdir.clone(), niceness: config.niceness },
        )
        .await?;
        (outcome.error_code, outcome.failed_command, outcome.captures)
    };

    upload_result(config, uploader, &wu, exit_code, failed_command, captures).await?;

    // Cleanup follows the upload succeeding, not the command's exit
    // status: a failed command's RESULT files (if any were written) are
    // still uploaded and must still be removed here, or a later
    // work-unit reusing the same result filename would find a stale
    // leftover and wrongly skip running its own commands.
    for result in &wu.results {
        let _ = tokio::fs::remove_file(config.workdir.join(result)).await;
    }
    tokio::fs::remove_file(wu_path).await?;
    Ok(())
}

async fn materialize_files(
    config: &ClientConfig,
    downloader: &Downloader,
    wu: &Workunit,
) -> Result<(), ClientError> {
    for file_ref in wu.all_file_refs() {
        let url_name = safe_substitute(&file_ref.filename, &arch_vars(&config.arch));
        let local_name = safe_substitute(&file_ref.filename, &arch_vars(""));
        let url = format!("{}/{}", config.server, url_name);
        let dest = config.dldir.join(&local_name);
        downloader.get_missing_file(&url, &dest, Some(&file_ref.sha1)).await?;
    }

    for file_ref in &wu.execfiles {
        let local_name = safe_substitute(&file_ref.filename, &arch_vars(""));
        let path = config.dldir.join(&local_name);
        let metadata = tokio::fs::metadata(&path).await?;
        let mut perms = metadata.permissions();
        if perms.mode() & 0o100 == 0 {
            perms.set_mode(perms.mode() | 0o100);
            tokio::fs::set_permissions(&path, perms).await?;
        }
    }
    Ok(())
}

fn arch_vars(arch: &str) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("ARCH".to_string(), arch.to_string());
    vars
}

async fn all_results_exist(config: &ClientConfig, wu: &Workunit) -> bool {
    for result in &wu.results {
        if tokio::fs::metadata(config.workdir.join(result)).await.is_err() {
            return false;
        }
    }
    true
}

async fn upload_result(
    config: &ClientConfig,
    uploader: &Uploader,
    wu: &Workunit,
    exit_code: i64,
    failed_command: Option<i64>,
    captures: Vec<wud_exec::CommandCapture>,
) -> Result<(), ClientError> {
    let mut files = Vec::new();
    for result in &wu.results {
        let path = config.workdir.join(result);
        if let Ok(bytes) = tokio::fs::read(&path).await {
            files.push(Attachment { filename: result.clone(), bytes });
        }
    }
    for (index, capture) in captures.iter().enumerate() {
        if let Some(stdout) = &capture.stdout {
            files.push(ResultUpload::stdio_attachment("stdout", index, stdout.clone()));
        }
        if let Some(stderr) = &capture.stderr {
            files.push(ResultUpload::stdio_attachment("stderr", index, stderr.clone()));
        }
    }

    let upload = ResultUpload {
        wuid: wu.wuid.clone(),
        client_id: config.clientid.clone(),
        exit_code: Some(exit_code),
        failed_command,
        files,
    };
    let url = format!("{}{}", config.server, config.postresultpath);
    uploader.upload(&url, upload).await?;
    Ok(())
}
