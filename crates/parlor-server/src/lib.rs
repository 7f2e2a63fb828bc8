pub mod connection;
pub mod handler;
pub mod limiter;
pub mod registry;
pub mod server;

pub use handler::ChatState;
pub use limiter::{RateDecision, RateLimiter};
pub use registry::SessionRegistry;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
