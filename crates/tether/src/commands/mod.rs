//! Command implementations for the tether CLI.

pub mod config;
pub mod probe;
pub mod run;
pub mod status;
