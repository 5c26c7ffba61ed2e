pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod extract;
pub mod gitsafe;
pub mod gradle;
pub mod guard;
pub mod logbus;
pub mod models;
pub mod pipeline;
pub mod runtime;
pub mod server;
pub mod sse;

#[cfg(test)]
pub mod testutil;

/// UTC wall-clock in RFC3339. One format everywhere keeps DB timestamp
/// strings lexicographically ordered.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
