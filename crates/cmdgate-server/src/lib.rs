pub mod http;

pub use http::{app_router, serve, LogServerState};
