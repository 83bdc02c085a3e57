pub mod checksum;
pub mod config;
pub mod download;
pub mod error;
pub mod generate;
pub mod index;
pub mod manifest;
pub mod path_safety;
pub mod plan;
pub mod progress;
pub mod security;
pub mod server;
pub mod watch;

pub use error::{Result, SyncError};
