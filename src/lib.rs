#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]

//! Concurrency limits shared by many processes through Redis.
//!
//! ```no_run
//! use concurrency_limit::{config::{LimitConfig, RedisConfig}, limit::ConcurrencyLimit};
//!
//! # async fn example() -> Result<(), concurrency_limit::limit::LimitError> {
//! let redis = RedisConfig::new("localhost", 6379);
//! let limit = ConcurrencyLimit::connect(&redis, LimitConfig::new("reports", 5)).await?;
//!
//! limit
//!     .run(|count| async move {
//!         println!("Running with {} holders", count);
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate tracing;

#[macro_use]
pub mod internal_events;
pub mod app;
pub mod cli;
pub mod config;
pub mod connections;
pub mod limit;
pub mod store;
pub mod trace;

pub use crate::{
    config::{Config, LimitConfig, RedisConfig},
    limit::{keys, ConcurrencyLimit, LimitError, Slot},
    store::{LockStore, MemoryStore, RedisStore, StoreError},
};
