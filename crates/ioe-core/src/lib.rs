pub mod api;
pub mod config;
pub mod error;
pub mod render;
pub mod wire;

#[cfg(feature = "client")]
pub mod client;

pub use error::ClientError;
