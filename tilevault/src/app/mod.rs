//! Application bootstrap and configuration.
//!
//! This module provides the `TileVaultApp` type, which turns a JSON
//! configuration into a started cache and the layers that share it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       TileVaultApp                        │
//! │                                                           │
//! │  AppConfig ──► CacheRegistry::build("cache") ──► cache    │
//! │                                                  │        │
//! │  "layers" ──► Layer(roads) ───────────────────────┤        │
//! │           ──► Layer(labels) ──────────────────────┘        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use tilevault::app::{AppConfig, TileVaultApp};
//!
//! let config = AppConfig::load(Path::new("tilevault.json"))?;
//! let app = TileVaultApp::start(config).await?;
//!
//! let roads = app.layer("roads")?;
//! let tile = roads.get_tile(coord, "png", &renderer, false).await?;
//! ```

mod bootstrap;
mod config;
mod error;

pub use bootstrap::TileVaultApp;
pub use config::{AppConfig, LayerConfig};
pub use error::AppError;
