//! Data Transfer Objects
//!
//! This module contains DTOs used at the edges of the orchestrator: requests
//! and responses of the caller-facing operations, and the status views
//! exchanged with provider adapters.

pub mod execution;
pub mod provider;
pub mod statistics;
