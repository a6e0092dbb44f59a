//! # Flag Engine Client
//!
//! The server-side runtime of the flag engine: it keeps a local copy of the
//! flag/segment data set in sync with the control plane (streaming or
//! polling), evaluates flags locally against per-request contexts via
//! `flag-engine-core`, and ships analytics events back in batches.
//!
//! ## Core Components
//!
//! - [`client::FlagClient`]: the application-facing facade
//! - [`config::Config`]: plain-record configuration with defaults
//! - [`store`]: the versioned in-memory store and the persistent-store
//!   caching wrapper
//! - [`datasource`]: streaming/polling ingestion and the update sink that
//!   owns commits, change fan-out, and the status machine
//! - [`bigsegments`]: out-of-band segment membership with an LRU cache
//! - [`events`]: the analytics pipeline (dedup, summaries, batched delivery)
//! - [`broadcast`]: typed listener fan-out for statuses and flag changes
//!
//! ## Examples
//!
//! ```rust,no_run
//! use flag_engine_client::client::FlagClient;
//! use flag_engine_client::config::Config;
//! use flag_engine_core::context::ContextBuilder;
//!
//! # async fn run() {
//! let client = FlagClient::build("my-sdk-key", Config::default()).unwrap();
//! if !client.start().await {
//!     eprintln!("flag data not ready yet; evaluations serve defaults");
//! }
//!
//! let context = ContextBuilder::new("user-123").build().unwrap();
//! if client.bool_variation(&context, "new-checkout", false) {
//!     // new behaviour
//! }
//! client.close().await;
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod bigsegments;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod datasource;
pub mod error;
pub mod events;
pub mod store;

// Re-export commonly used types
pub use client::{AllFlagsOptions, FeatureFlagsState, FlagClient};
pub use config::Config;
pub use error::{ClientError, StoreError};

// The evaluation plane is part of the public surface.
pub use flag_engine_core::context::{Context, ContextBuilder, MultiContextBuilder};
pub use flag_engine_core::reason::{Detail, ErrorKind, Reason};
