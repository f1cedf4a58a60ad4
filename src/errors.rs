// src/errors.rs

//! Crate-wide error aliases.
//!
//! Binary and I/O paths use `anyhow`; the step-level error taxonomy lives
//! in [`crate::engine::task::TaskError`].

pub use anyhow::{Error, Result};
