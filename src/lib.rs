pub mod api;
pub mod config;
pub mod deploy;
pub mod errors;
pub mod fixer;
pub mod infra;
pub mod jobs;
pub mod process;
pub mod project;
pub mod runtime;
pub mod sandbox;
pub mod server;
