//! pvedash Common Library
//!
//! Shared data model, error types and the response cache used by the
//! API client and the terminal UI.

pub mod cache;
pub mod error;
pub mod types;

pub use cache::{ttl_for_path, ResponseCache};
pub use error::{Error, Result};
pub use types::*;

/// pvedash version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default cache directory
pub fn default_cache_dir() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".cache")
        .join("pvedash")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
