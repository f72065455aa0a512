//! Background drivers built on the queue operations.

pub mod sweeper;

pub use sweeper::{SweepConfig, Sweeper};
