//! Read-only HTTP API
//!
//! Round history, per-round fairness verification and settlement counters
//! for the presentation layer. No endpoint mutates the ledger.

pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;

pub use handlers::AppState;
pub use server::ApiServer;
