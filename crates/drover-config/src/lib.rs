//! # drover-config
//!
//! Configuration for the drover node: a `drover.toml` schema with
//! sensible defaults, environment overrides, validation, and
//! hot-reload.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::DroverConfig;
