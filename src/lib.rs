// ABOUTME: Library root for citizen-sync
// ABOUTME: Exports the sync engine, scheduler and warehouse modules

pub mod auth;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod cursor;
pub mod error;
pub mod fetch;
pub mod lock;
pub mod merge;
pub mod orchestrator;
pub mod postgres;
pub mod regenerate;
pub mod remote;
pub mod scheduler;
pub mod service;
pub mod utils;
pub mod warehouse;

#[cfg(test)]
mod test_support;

pub use error::{Result, SyncError};
