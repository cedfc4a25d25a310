//! feeder: a library for draining a lock-coordinated buffer file into a
//! TimescaleDB table over the PostgreSQL COPY protocol.
//!
//! This library provides components for snapshotting an append-only CSV
//! buffer file under an exclusive advisory lock, bulk-loading the snapshot
//! with `COPY ... FROM STDIN`, and truncating only what the server
//! confirmed committed.
//!
//! # Example
//!
//! ```ignore
//! use feeder::{run_feeder, Config, error::FeederError};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), FeederError> {
//!     let config = Config {
//!         relation: "sensor_data".into(),
//!         ..Config::default()
//!     };
//!     let stats = run_feeder(config).await?;
//!     eprintln!("Committed {} rows", stats.rows_committed);
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;

// Re-export main types
pub use config::{Config, TruncateMode};
pub use pipeline::{run_feeder, Feeder, FeederStats};
