//! Scheduler layer for the controller
//!
//! This layer pulls build and pod events from their sources and routes
//! them to the controller, isolating each item from the others.

pub mod dispatcher;

pub use dispatcher::{DispatchConfig, DispatchMode, Dispatcher, RetryPolicy};
