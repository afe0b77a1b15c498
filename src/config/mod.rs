//! Configuration loading and application settings.

mod settings;

pub use settings::*;
