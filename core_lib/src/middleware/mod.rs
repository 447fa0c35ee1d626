//! Middleware components for the HTTP server

pub mod logging;
pub mod quota;

pub use logging::logging_layer;
pub use quota::{download_limiter, upload_limiter, MeteredStream, TRAFFIC_UPLOADED_HEADER};
