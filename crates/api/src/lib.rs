//! HTTP probes for the digest writer.

pub mod response;
pub mod routes;
pub mod state;

pub use routes::router;
pub use state::AppState;
