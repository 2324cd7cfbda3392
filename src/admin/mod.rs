//! HTTP observability sidecar: `/health`, `/`, `/ready`, `/stats`.

mod api;
mod server;

pub use api::{AdminApi, AdminConfigView};
pub use server::AdminServer;
