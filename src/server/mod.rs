//! Server module for Blockgraph
//!
//! Contains the server initialization and runtime logic.
//!
//! # Module Structure
//!
//! - `config`: Configuration structures
//! - `loader`: Configuration loading from files and environment
//! - `routes`: HTTP and WebSocket endpoints
//! - `init`: Server initialization and run loop

pub mod config;
mod init;
mod loader;
mod routes;

// Re-export public API
pub use config::AppConfig;
pub use init::run;
pub use loader::load_config;
