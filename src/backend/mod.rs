//! HTTP and push-stream access to the ride backend.

pub mod client;
pub mod stream;
pub mod types;

pub use client::ApiClient;
pub use stream::OrderEventStream;
