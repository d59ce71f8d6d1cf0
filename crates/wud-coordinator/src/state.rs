//! Shared runtime state for the HTTP server: the store plus the directory
//! files are served from and saved under.

use std::path::PathBuf;
use std::sync::Arc;

use wud_db::WuAccess;

#[derive(Clone)]
pub struct AppState {
    pub db: WuAccess,
    /// Root directory for both `GET /<filename>` file serving and where
    /// uploaded result attachments are written.
    pub files_dir: PathBuf,
}

impl AppState {
    pub fn new(db: WuAccess, files_dir: PathBuf) -> Arc<Self> {
        Arc::new(Self { db, files_dir })
    }
}
