//! REST API: router, shared state, middleware and handlers.

pub mod auth;
pub mod handlers;
pub mod rate_limit;
pub mod router;
pub mod state;

pub use router::create_router;
pub use state::AppState;
