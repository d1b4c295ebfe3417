//! poolkit library: command-line driver logic for the pool workspace.

pub mod app;
pub mod config;
pub mod errors;
pub mod version;
