//! annosync library
//!
//! Offline-first annotation store with bidirectional sync. The host
//! application drives it through the services and the sync coordinator.

pub mod app;
pub mod config;
pub mod database;
pub mod error;
pub mod services;
pub mod sync;
