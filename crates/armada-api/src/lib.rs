//! Docker-compatible HTTP surface over an Armada cluster.
//!
//! The router ([`api`]) serves aggregated cluster state directly where it
//! can and proxies to the owning engine where it must ([`proxy`]), including
//! hijacked attach/exec sessions.

pub mod api;
pub mod error;
pub mod handlers;
pub mod proxy;
pub mod server;

pub use api::{create_router, AppState, API_VERSION, MIN_API_VERSION};
pub use error::{ApiError, Result};
pub use server::ApiServer;
