//! Client entry point: parses the settings the original `wuclient.py`
//! read from `argparse` and runs the fetch/exec/upload loop until the
//! coordinator reports no more work.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use wud_client::{run_client_loop, ClientConfig};

#[derive(Parser)]
#[command(name = "wud-client", about = "Work-unit execution client")]
struct Cli {
    #[arg(long)]
    clientid: String,
    #[arg(long)]
    dldir: PathBuf,
    #[arg(long)]
    server: String,
    #[arg(long)]
    workdir: PathBuf,

    #[arg(long, default_value = "WU")]
    wu_filename: String,
    #[arg(long, default_value = "/cgi-bin/getwu")]
    getwupath: String,
    #[arg(long, default_value = "/cgi-bin/upload.py")]
    postresultpath: String,
    #[arg(long, default_value_t = 0)]
    debug: u8,
    #[arg(long, default_value = "")]
    arch: String,
    #[arg(long, default_value_t = 300)]
    downloadretry: u64,
    #[arg(long, default_value_t = 0)]
    niceness: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = ClientConfig {
        clientid: cli.clientid,
        dldir: cli.dldir,
        server: cli.server,
        workdir: cli.workdir,
        wu_filename: cli.wu_filename,
        getwupath: cli.getwupath,
        postresultpath: cli.postresultpath,
        arch: cli.arch,
        downloadretry: Duration::from_secs(cli.downloadretry),
        niceness: cli.niceness,
    };

    run_client_loop(&config).await?;
    Ok(())
}

fn init_tracing(debug: u8) {
    let level = match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()),
        )
        .init();
}
