//! Kiln Core
//!
//! Core types for the Kiln build controller.
//!
//! This crate contains:
//! - Domain types: Build and Pod records and their lifecycle states
//! - DTOs: Request and listing shapes for the HTTP API

pub mod domain;
pub mod dto;
