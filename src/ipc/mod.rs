mod error;
mod gate;
mod handlers;
mod router;
mod types;

pub use router::handle_request;
pub use types::{AppState, Request};
