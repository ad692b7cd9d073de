//! Wheels - an asynchronous image loading and caching core.
//!
//! Images are resolved through a memory cache, a disk-backed storage cache
//! and a caller-supplied producer, then applied to display targets on a
//! single main loop. Each target is owned by at most one in-flight load.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Domain layer containing entities, errors, and port definitions.
pub mod domain;
/// Infrastructure layer containing executors, caches and configuration.
pub mod infrastructure;
/// Presentation layer containing display targets.
pub mod presentation;

/// Current version of the application.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name.
pub const NAME: &str = "wheels";
