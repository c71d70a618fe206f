//! Gateway binary surface: axum server with the chat WebSocket, the
//! one-shot streaming endpoint, the admin observer socket, and the
//! monitoring control plane.

pub mod admin;
pub mod identity;
pub mod monitoring;
pub mod server;
pub mod sse;
pub mod state;
pub mod ws;

pub use server::{build_router, start_gateway};
pub use state::AppState;
