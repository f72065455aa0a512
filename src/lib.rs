//! # redeque
//!
//! Lease-based distributed work queues on Redis.
//!
//! Producers enqueue items under named queues; consumers claim them for
//! a bounded lease and acknowledge when done. A claim whose lease runs
//! out is returned to its queue, so every item is delivered at least once.
//! All coordination happens in Redis through single commands and Lua
//! scripts; see [`db`] for the key layout and [`db::scripts`] for the
//! scripts.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod telemetry;

pub use db::keys::QueueName;
pub use db::{Db, DbOptions};
pub use error::{Error, Result};
