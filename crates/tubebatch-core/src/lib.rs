//! Tubebatch Core Library
//!
//! This crate provides the core functionality for the Tubebatch application:
//! - Incremental playlist/channel fetching (flat listing plus optional
//!   per-item enrichment)
//! - An entry store with per-item selection, quality, group, and lifecycle
//!   state
//! - Filtering, sorting, and group-based configuration overrides
//! - Sequential batch downloading with rate-limit backoff and cooperative
//!   cancellation
//!
//! All I/O goes through the [`backend::ExtractionBackend`] trait; background
//! work publishes typed [`session::SessionEvent`]s that the presentation
//! layer (desktop or CLI) drains.

pub mod backend;
pub mod backoff;
pub mod config;
pub mod entry;
pub mod error;
pub mod fetch;
pub mod format;
pub mod group;
pub mod scheduler;
pub mod select;
pub mod session;
pub mod template;

pub use backend::{ExtractionBackend, YtDlpBackend};
pub use config::AppConfig;
pub use entry::EntryStore;
pub use error::{Error, Result};
pub use fetch::FetchController;
pub use scheduler::{CancelToken, DownloadScheduler};
pub use session::{SessionContext, SessionEvent};
