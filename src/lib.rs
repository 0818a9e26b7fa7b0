pub mod adapters;
pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod logging;
