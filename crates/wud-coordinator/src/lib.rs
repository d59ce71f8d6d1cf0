//! The coordinator: HTTP server library target plus the administrative
//! operations backing its CLI. `main.rs` is a thin binary over this.

pub mod routes;
pub mod state;

pub use state::AppState;
