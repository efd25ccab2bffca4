//! # Conductor Core
//! Configuration and the error taxonomy shared by every Conductor crate.

pub mod config;
pub mod error;

pub use config::ConductorConfig;
pub use error::{ConductorError, Result};
