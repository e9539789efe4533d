//! Shared utilities for sonicsim

pub mod wait;

pub use wait::{wait_until, wait_until_async, Satisfied};
