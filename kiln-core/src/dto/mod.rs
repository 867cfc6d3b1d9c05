//! Data Transfer Objects
//!
//! Lightweight request and listing shapes used by the controller's HTTP API.

pub mod build;
