pub mod config;
pub mod query;
pub mod security;
pub mod server;
pub mod utils;

// Crate version exposed for runtime queries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
