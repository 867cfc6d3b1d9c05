//! Core domain types
//!
//! This module contains the core domain structures used across Kiln services.
//! A Build is persisted by the store and advanced by the controller; a Pod is
//! produced by a build strategy and observed through the cluster.

pub mod build;
pub mod pod;
