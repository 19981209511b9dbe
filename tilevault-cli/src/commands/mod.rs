//! CLI command implementations.

pub mod clean;
pub mod common;
pub mod layers;
pub mod read;
pub mod remove;
pub mod write;
