// src/config/mod.rs

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_app_config, load_fleet};
pub use model::{AppConfig, DeployProfile, ServerRow};
pub use validate::{validate_app_config, validate_fleet};
