//! SHDB is an embeddable web server which combines a static file cache with a tiny JSON
//! document database exposed via a REST-like API.
//!
//! # Introduction
//! **SHDB** ("self hosted database") targets small self-contained applications: a single
//! process serves a directory of public files along with a JSON document which is treated
//! as a set of named collections (comparable to tables). The whole working set lives in
//! memory: public files are cached as raw bytes and the JSON document is kept as a shared
//! snapshot, so read requests never touch the disk.
//!
//! The server itself speaks plain HTTP via [hyper](https://hyper.rs) and is intended to
//! run behind a transport which terminates TLS. Everything else - routing, the document
//! store, the file cache and the configuration system - is provided by this crate.
//!
//! # Features
//! * **Static file delivery from memory** - the public directory is walked once at startup
//!   and each file is cached along with its content type and modification timestamp.
//!   Subsequent refreshes only re-read files whose modification time changed on disk.
//! * **JSON document API** - the reserved path prefix `/shdb/json/` exposes the document
//!   as a REST-like API: collections can be read, filtered (including dotted paths into
//!   nested objects), sorted and paginated; records are inserted, replaced and deleted by
//!   their numeric `id`. Every successful write persists the complete document back to
//!   disk before it becomes visible, so memory and disk never diverge.
//! * **Private fields** - fields and collections whose name starts with `_` are kept in
//!   the persisted document but are removed from every read response.
//! * **Custom fallback handling** - requests which neither match a cached file nor the
//!   API prefix are delegated to a user supplied [FallbackHandler](router::FallbackHandler).
//! * **Reload-aware config facility** which observes the settings file for changes so that
//!   e.g. the server can re-bind to a new address without a restart.
//! * **100% Async/Await** - the whole server builds upon [tokio](https://tokio.rs/).
//!
//! # Modules
//! * **Store**: The in-memory JSON document along with its query engine. See [crate::store]
//! * **Files**: The static file cache. See [crate::files]
//! * **Router**: Dispatches requests to the cache, the store or the fallback handler.
//!   See [crate::router]
//! * **Server**: The main event loop binding the HTTP server. See [crate::server]
//!
//! # Example
//! ```no_run
//! use shdb::builder::Builder;
//! use shdb::server::Server;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Set up logging, config, signal handling and the server itself...
//!     let platform = Builder::new().enable_all().build().await;
//!
//!     // Load the JSON document and fill the static file cache (both paths are taken
//!     // from the config)...
//!     shdb::store::install(platform.clone()).await.unwrap();
//!     shdb::files::install(platform.clone()).await.unwrap();
//!
//!     // Run the main event loop...
//!     platform.require::<Server>().event_loop().await;
//! }
//! ```
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod average;
pub mod builder;
pub mod config;
pub mod files;
pub mod fmt;
pub mod platform;
pub mod router;
pub mod server;
pub mod signals;
pub mod store;

/// Contains the version of the SHDB library.
pub const SHDB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate shdb;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
