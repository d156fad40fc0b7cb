// Public API - shared by the binary and integration tests
pub mod cli;
pub mod config;
pub mod export;
pub mod ping;
pub mod probe;
pub mod state;
