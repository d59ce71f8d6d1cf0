//! Coordinator entry point: either runs the HTTP server (`serve`) or
//! performs one administrative operation directly against the database
//! file (`create`, `add`, `assign`, `result`, `query`, `cancel`) — the
//! idiomatic-clap equivalent of the original single-dash flag set
//! (`-create -add -assign -result -prio -avail -assigned -receivedok
//! -receivederr -all -dump`, see DESIGN.md).

use std::io::Read;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};
use wud_coordinator::{routes, state::AppState};
use wud_db::{connect, migrate, WuAccess};
use wud_state::WuStatus;

#[derive(Parser)]
#[command(name = "wud-coordinator", about = "Work-unit dispatch coordinator")]
struct Cli {
    /// Path to the SQLite database file.
    #[arg(long, default_value = "wud.db")]
    dbname: PathBuf,

    /// Debug verbosity, 0-2 (mirrors the client's --debug flag).
    #[arg(long, default_value_t = 0)]
    debug: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve {
        #[arg(long, default_value = "127.0.0.1:8080")]
        addr: SocketAddr,
        #[arg(long, default_value = "/cgi-bin/getwu")]
        getwupath: String,
        #[arg(long, default_value = "/cgi-bin/upload.py")]
        postresultpath: String,
        #[arg(long, default_value = "files")]
        files_dir: PathBuf,
    },
    /// Create one work-unit. Its text is read from stdin.
    Create {
        #[arg(long)]
        prio: Option<i64>,
    },
    /// Create any number of work-units from stdin, blank-line separated.
    Add {
        #[arg(long)]
        prio: Option<i64>,
    },
    /// Assign the next AVAILABLE work-unit to a client.
    Assign { clientid: String },
    /// Record a result directly (bypassing HTTP), for operator use.
    Result {
        clientid: String,
        wuid: String,
        filename: String,
        filepath: String,
    },
    /// List work-units, optionally filtered by status.
    Query {
        #[arg(long)]
        avail: bool,
        #[arg(long)]
        assigned: bool,
        #[arg(long)]
        receivedok: bool,
        #[arg(long)]
        receivederr: bool,
        #[arg(long)]
        all: bool,
        #[arg(long)]
        dump: bool,
    },
    /// Cancel a work-unit.
    Cancel { wuid: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let url = format!("sqlite://{}?mode=rwc", cli.dbname.display());
    let pool = connect(&url).await.context("connecting to database")?;
    migrate(&pool).await.context("running migrations")?;
    let db = WuAccess::new(pool);

    match cli.command {
        Command::Serve { addr, getwupath, postresultpath, files_dir } => {
            serve(db, addr, getwupath, postresultpath, files_dir).await?
        }
        Command::Create { prio } => {
            let text = read_stdin()?;
            let wuid = db.create(&text, prio).await?;
            println!("{wuid}");
        }
        Command::Add { prio } => {
            let text = read_stdin()?;
            for block in text.split("\n\n") {
                if block.trim().is_empty() {
                    continue;
                }
                let wuid = db.create(block, prio).await?;
                println!("{wuid}");
            }
        }
        Command::Assign { clientid } => match db.assign(&clientid).await? {
            Some(text) => print!("{text}"),
            None => eprintln!("no work available"),
        },
        Command::Result { clientid, wuid, filename, filepath } => {
            let files = vec![wud_db::ResultFile { filename, path: filepath }];
            db.result(&wuid, &clientid, &files, 0, None).await?;
        }
        Command::Query { avail, assigned, receivedok, receivederr, all, dump } => {
            let rows = if all || dump {
                db.query(&wud_mapper::ConditionSet::new(), None, None).await?
            } else if avail {
                db.query_by_status(WuStatus::Available).await?
            } else if assigned {
                db.query_by_status(WuStatus::Assigned).await?
            } else if receivedok {
                db.query_by_status(WuStatus::ReceivedOk).await?
            } else if receivederr {
                db.query_by_status(WuStatus::ReceivedError).await?
            } else {
                db.query(&wud_mapper::ConditionSet::new(), None, None).await?
            };
            for row in rows {
                if dump {
                    println!("{}", serde_json::to_string(&row)?);
                } else {
                    println!("{}\t{:?}\t{}", row.wuid, row.status, row.priority);
                }
            }
        }
        Command::Cancel { wuid } => {
            let cancelled = db.cancel(&wuid).await?;
            println!("cancelled={cancelled}");
        }
    }

    Ok(())
}

async fn serve(
    db: WuAccess,
    addr: SocketAddr,
    getwupath: String,
    postresultpath: String,
    files_dir: PathBuf,
) -> Result<()> {
    let state = AppState::new(db, files_dir);
    let app = routes::build_router(Arc::clone(&state), &getwupath, &postresultpath).layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    info!("wud-coordinator listening on http://{addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .await
        .context("server crashed")?;
    Ok(())
}

fn read_stdin() -> Result<String> {
    let mut text = String::new();
    std::io::stdin().read_to_string(&mut text)?;
    Ok(text)
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
